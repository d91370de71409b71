//! Builders for spreadsheet payloads.

#![allow(dead_code)]

use std::io::{Cursor, Write};

use zip::write::SimpleFileOptions;

/// Builds CSV bytes from a header and rows. Fields are written as-is, so
/// keep commas and quotes out of test values.
pub struct CsvBuilder {
    lines: Vec<String>,
}

impl CsvBuilder {
    pub fn new(header: &[&str]) -> Self {
        Self {
            lines: vec![header.join(",")],
        }
    }

    pub fn row(mut self, values: &[&str]) -> Self {
        self.lines.push(values.join(","));
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut text = self.lines.join("\n");
        text.push('\n');
        text.into_bytes()
    }
}

/// Timesheet CSV with `employee,hours` columns.
pub fn timesheet_csv(rows: &[(&str, &str)]) -> Vec<u8> {
    rows.iter()
        .fold(CsvBuilder::new(&["Employee", "Hours"]), |b, (employee, hours)| {
            b.row(&[employee, hours])
        })
        .build()
}

/// Builds a single-sheet XLSX workbook using inline strings.
pub struct XlsxBuilder {
    sheet_name: String,
    rows: Vec<Vec<XlsxValue>>,
}

pub enum XlsxValue {
    Text(String),
    Number(f64),
}

impl XlsxBuilder {
    pub fn new(sheet_name: &str) -> Self {
        Self {
            sheet_name: sheet_name.to_string(),
            rows: Vec::new(),
        }
    }

    pub fn text_row(mut self, values: &[&str]) -> Self {
        self.rows.push(
            values
                .iter()
                .map(|v| XlsxValue::Text(v.to_string()))
                .collect(),
        );
        self
    }

    pub fn row(mut self, values: Vec<XlsxValue>) -> Self {
        self.rows.push(values);
        self
    }

    pub fn build(self) -> Vec<u8> {
        let workbook = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"
  xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships">
  <sheets><sheet name="{}" sheetId="1" r:id="rId1"/></sheets>
</workbook>"#,
            self.sheet_name
        );
        let rels = r#"<?xml version="1.0" encoding="UTF-8"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">
  <Relationship Id="rId1" Type="worksheet" Target="worksheets/sheet1.xml"/>
</Relationships>"#;

        let mut sheet = String::from("<worksheet><sheetData>");
        for (r, row) in self.rows.iter().enumerate() {
            sheet.push_str(&format!("<row r=\"{}\">", r + 1));
            for (c, value) in row.iter().enumerate() {
                let reference = format!("{}{}", column_letter(c), r + 1);
                match value {
                    XlsxValue::Text(text) => sheet.push_str(&format!(
                        "<c r=\"{}\" t=\"inlineStr\"><is><t>{}</t></is></c>",
                        reference, text
                    )),
                    XlsxValue::Number(n) => {
                        sheet.push_str(&format!("<c r=\"{}\"><v>{}</v></c>", reference, n))
                    }
                }
            }
            sheet.push_str("</row>");
        }
        sheet.push_str("</sheetData></worksheet>");

        zip_parts(&[
            ("xl/workbook.xml", workbook.as_str()),
            ("xl/_rels/workbook.xml.rels", rels),
            ("xl/worksheets/sheet1.xml", sheet.as_str()),
        ])
    }
}

fn column_letter(index: usize) -> char {
    (b'A' + index as u8) as char
}

fn zip_parts(parts: &[(&str, &str)]) -> Vec<u8> {
    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, content) in parts {
        zip.start_file(*name, SimpleFileOptions::default()).unwrap();
        zip.write_all(content.as_bytes()).unwrap();
    }
    zip.finish().unwrap().into_inner()
}

/// A one-sheet workbook whose worksheet part is `sheet_xml` verbatim.
pub fn xlsx_with_sheet_xml(sheet_xml: &str) -> Vec<u8> {
    let workbook = r#"<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"
  xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships">
  <sheets><sheet name="Sheet1" sheetId="1" r:id="rId1"/></sheets>
</workbook>"#;
    zip_parts(&[
        ("xl/workbook.xml", workbook),
        ("xl/worksheets/sheet1.xml", sheet_xml),
    ])
}

/// Bytes that start like a zip archive but are not one.
pub fn corrupt_xlsx() -> Vec<u8> {
    b"PK\x03\x04this is not really a workbook".to_vec()
}
