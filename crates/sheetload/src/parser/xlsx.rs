//! `.xlsx` / `.xlsm` reader.
//!
//! An OOXML workbook is a zip archive of XML parts. We read the shared
//! string table, resolve the requested worksheet through the workbook
//! relationships, and walk the sheet's `<sheetData>` placing every cell by
//! its `r` reference so sparse rows and columns keep their positions.

use std::collections::HashMap;
use std::io::{Cursor, Read, Seek};

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use zip::result::ZipError;
use zip::ZipArchive;

use super::{Cell, Grid, TableParser};
use crate::error::ParseError;

pub struct XlsxParser;

impl TableParser for XlsxParser {
    fn parse(&self, bytes: &[u8], _extension: &str, sheet: Option<&str>) -> Result<Grid, ParseError> {
        let mut archive = ZipArchive::new(Cursor::new(bytes))
            .map_err(|e| ParseError::Spreadsheet(format!("not a valid workbook archive: {}", e)))?;

        let shared = match read_part(&mut archive, "xl/sharedStrings.xml")? {
            Some(xml) => parse_shared_strings(&xml)?,
            None => Vec::new(),
        };

        let workbook = read_part(&mut archive, "xl/workbook.xml")?
            .ok_or_else(|| ParseError::Spreadsheet("missing xl/workbook.xml".to_string()))?;
        let sheets = parse_workbook(&workbook)?;

        let relationships = match read_part(&mut archive, "xl/_rels/workbook.xml.rels")? {
            Some(xml) => parse_relationships(&xml)?,
            None => HashMap::new(),
        };

        let (index, selected) = match sheet {
            Some(name) => sheets
                .iter()
                .enumerate()
                .find(|(_, s)| s.name == name)
                .ok_or_else(|| ParseError::SheetNotFound(name.to_string()))?,
            None => sheets
                .iter()
                .enumerate()
                .next()
                .ok_or_else(|| ParseError::Spreadsheet("workbook has no worksheets".to_string()))?,
        };

        let part = relationships
            .get(&selected.relationship_id)
            .map(|target| resolve_target(target))
            .unwrap_or_else(|| format!("xl/worksheets/sheet{}.xml", index + 1));

        let xml = read_part(&mut archive, &part)?
            .ok_or_else(|| ParseError::Spreadsheet(format!("missing worksheet part {}", part)))?;

        parse_sheet(&xml, &shared)
    }

    fn supports(&self, extension: &str) -> bool {
        matches!(extension, "xlsx" | "xlsm")
    }
}

struct SheetEntry {
    name: String,
    relationship_id: String,
}

fn read_part<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    name: &str,
) -> Result<Option<String>, ParseError> {
    let mut file = match archive.by_name(name) {
        Ok(file) => file,
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(ParseError::Spreadsheet(format!("{}: {}", name, e))),
    };
    let mut xml = String::new();
    file.read_to_string(&mut xml)
        .map_err(|e| ParseError::Spreadsheet(format!("{}: {}", name, e)))?;
    Ok(Some(xml))
}

fn xml_error(e: impl std::fmt::Display) -> ParseError {
    ParseError::Spreadsheet(format!("malformed XML: {}", e))
}

/// Relationship targets are relative to `xl/` unless absolute.
fn resolve_target(target: &str) -> String {
    match target.strip_prefix('/') {
        Some(absolute) => absolute.to_string(),
        None => format!("xl/{}", target),
    }
}

fn attribute(element: &BytesStart<'_>, local_name: &[u8]) -> Result<Option<String>, ParseError> {
    for attr in element.attributes() {
        let attr = attr.map_err(xml_error)?;
        if attr.key.local_name().as_ref() == local_name {
            return Ok(Some(attr.unescape_value().map_err(xml_error)?.into_owned()));
        }
    }
    Ok(None)
}

fn parse_shared_strings(xml: &str) -> Result<Vec<String>, ParseError> {
    let mut reader = Reader::from_str(xml);
    let mut strings = Vec::new();
    let mut current: Option<String> = None;
    let mut in_text = false;
    // Phonetic runs (<rPh>) repeat the reading of the string, not its value.
    let mut in_phonetic = false;

    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_text = true,
                b"rPh" => in_phonetic = true,
                _ => {}
            },
            Event::Empty(e) if e.local_name().as_ref() == b"si" => strings.push(String::new()),
            Event::End(e) => match e.local_name().as_ref() {
                b"si" => strings.extend(current.take()),
                b"t" => in_text = false,
                b"rPh" => in_phonetic = false,
                _ => {}
            },
            Event::Text(t) if in_text && !in_phonetic => {
                if let Some(s) = current.as_mut() {
                    s.push_str(&t.unescape().map_err(xml_error)?);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(strings)
}

fn parse_workbook(xml: &str) -> Result<Vec<SheetEntry>, ParseError> {
    let mut reader = Reader::from_str(xml);
    let mut sheets = Vec::new();

    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"sheet" => {
                let name = attribute(&e, b"name")?.unwrap_or_default();
                let relationship_id = attribute(&e, b"id")?.unwrap_or_default();
                sheets.push(SheetEntry {
                    name,
                    relationship_id,
                });
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(sheets)
}

fn parse_relationships(xml: &str) -> Result<HashMap<String, String>, ParseError> {
    let mut reader = Reader::from_str(xml);
    let mut map = HashMap::new();

    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"Relationship" => {
                if let (Some(id), Some(target)) =
                    (attribute(&e, b"Id")?, attribute(&e, b"Target")?)
                {
                    map.insert(id, target);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(map)
}

struct PendingCell {
    column: usize,
    kind: String,
    value: String,
}

impl PendingCell {
    fn resolve(self, shared: &[String]) -> Result<Cell, ParseError> {
        let cell = match self.kind.as_str() {
            "s" => {
                let index: usize = self.value.trim().parse().map_err(|_| {
                    ParseError::Spreadsheet(format!("bad shared string index '{}'", self.value))
                })?;
                let text = shared.get(index).ok_or_else(|| {
                    ParseError::Spreadsheet(format!("shared string {} out of range", index))
                })?;
                text_cell(text)
            }
            "str" | "inlineStr" => text_cell(&self.value),
            "b" => Cell::Integer(i64::from(self.value.trim() == "1")),
            "e" => Cell::Null,
            _ => Cell::infer(&self.value),
        };
        Ok(cell)
    }
}

fn text_cell(text: &str) -> Cell {
    if text.trim().is_empty() {
        Cell::Null
    } else {
        Cell::Text(text.to_string())
    }
}

/// Largest sheet Excel can address: column XFD, row 1048576.
const MAX_COLUMNS: usize = 16_384;
const MAX_ROWS: usize = 1_048_576;

/// Leading part of an untrusted reference, for error messages.
fn excerpt(reference: &str) -> String {
    reference.chars().take(16).collect()
}

/// Zero-based column index of a cell reference such as `AB12`. `Ok(None)`
/// when the reference has no column letters.
fn column_index(reference: &str) -> Result<Option<usize>, ParseError> {
    let mut number: Option<usize> = None;
    for b in reference.bytes().take_while(u8::is_ascii_alphabetic) {
        let digit = (b.to_ascii_uppercase() - b'A') as usize + 1;
        number = Some(
            number
                .unwrap_or(0)
                .checked_mul(26)
                .and_then(|n| n.checked_add(digit))
                .filter(|n| *n <= MAX_COLUMNS)
                .ok_or_else(|| {
                    ParseError::Spreadsheet(format!(
                        "cell '{}' is past the last column XFD",
                        excerpt(reference)
                    ))
                })?,
        );
    }
    Ok(number.map(|n| n - 1))
}

fn place(row: &mut Vec<Cell>, column: usize, cell: Cell) -> Result<(), ParseError> {
    if column >= MAX_COLUMNS {
        return Err(ParseError::Spreadsheet(format!(
            "row has more than {} columns",
            MAX_COLUMNS
        )));
    }
    if row.len() <= column {
        row.resize(column + 1, Cell::Null);
    }
    row[column] = cell;
    Ok(())
}

/// Pads the grid with empty rows up to the 1-based row number in `r`.
fn open_row(grid: &mut Grid, element: &BytesStart<'_>) -> Result<(), ParseError> {
    let target = match attribute(element, b"r")? {
        Some(r) if !r.is_empty() && r.bytes().all(|b| b.is_ascii_digit()) => r
            .parse::<usize>()
            .ok()
            .filter(|n| *n <= MAX_ROWS)
            .ok_or_else(|| {
                ParseError::Spreadsheet(format!(
                    "row {} is past the last row {}",
                    excerpt(&r),
                    MAX_ROWS
                ))
            })?
            .saturating_sub(1),
        _ => grid.len(),
    };
    if target >= MAX_ROWS {
        return Err(ParseError::Spreadsheet(format!(
            "sheet has more than {} rows",
            MAX_ROWS
        )));
    }
    while grid.len() < target {
        grid.push(Vec::new());
    }
    Ok(())
}

fn start_cell(element: &BytesStart<'_>, next_column: usize) -> Result<PendingCell, ParseError> {
    let column = match attribute(element, b"r")? {
        Some(reference) => column_index(&reference)?.unwrap_or(next_column),
        None => next_column,
    };
    let kind = attribute(element, b"t")?.unwrap_or_default();
    Ok(PendingCell {
        column,
        kind,
        value: String::new(),
    })
}

fn parse_sheet(xml: &str, shared: &[String]) -> Result<Grid, ParseError> {
    let mut reader = Reader::from_str(xml);
    let mut grid: Grid = Vec::new();
    let mut row: Vec<Cell> = Vec::new();
    let mut cell: Option<PendingCell> = None;
    let mut capture = false;

    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"row" => {
                    open_row(&mut grid, &e)?;
                    row.clear();
                }
                b"c" => cell = Some(start_cell(&e, row.len())?),
                b"v" | b"t" if cell.is_some() => capture = true,
                _ => {}
            },
            Event::Empty(e) => {
                if e.local_name().as_ref() == b"row" {
                    open_row(&mut grid, &e)?;
                    grid.push(Vec::new());
                }
            }
            Event::Text(t) if capture => {
                if let Some(c) = cell.as_mut() {
                    c.value.push_str(&t.unescape().map_err(xml_error)?);
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"v" | b"t" => capture = false,
                b"c" => {
                    if let Some(c) = cell.take() {
                        let column = c.column;
                        place(&mut row, column, c.resolve(shared)?)?;
                    }
                }
                b"row" => grid.push(std::mem::take(&mut row)),
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(grid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn workbook(parts: &[(&str, &str)]) -> Vec<u8> {
        let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, content) in parts {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(content.as_bytes()).unwrap();
        }
        zip.finish().unwrap().into_inner()
    }

    const WORKBOOK: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"
  xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships">
  <sheets>
    <sheet name="Summary" sheetId="1" r:id="rId1"/>
    <sheet name="Hours" sheetId="2" r:id="rId2"/>
  </sheets>
</workbook>"#;

    const RELS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">
  <Relationship Id="rId1" Type="worksheet" Target="worksheets/sheet1.xml"/>
  <Relationship Id="rId2" Type="worksheet" Target="/xl/worksheets/sheet2.xml"/>
</Relationships>"#;

    const SHARED: &str = r#"<sst xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main">
  <si><t>employee</t></si>
  <si><r><t>Ali</t></r><r><t>ce</t></r><rPh><t>ありす</t></rPh></si>
  <si><t>R&amp;D</t></si>
</sst>"#;

    const SHEET1: &str = r#"<worksheet><sheetData>
  <row r="1"><c r="A1" t="inlineStr"><is><t>only</t></is></c></row>
</sheetData></worksheet>"#;

    const SHEET2: &str = r#"<worksheet><sheetData>
  <row r="1"><c r="A1" t="s"><v>0</v></c><c r="C1" t="str"><v>hours</v></c></row>
  <row r="3"><c r="A3" t="s"><v>1</v></c><c r="B3" t="s"><v>2</v></c><c r="C3"><v>7.5</v></c></row>
  <row r="4"><c r="A4" t="b"><v>1</v></c><c r="C4"><v>8</v></c></row>
</sheetData></worksheet>"#;

    fn sample() -> Vec<u8> {
        workbook(&[
            ("xl/workbook.xml", WORKBOOK),
            ("xl/_rels/workbook.xml.rels", RELS),
            ("xl/sharedStrings.xml", SHARED),
            ("xl/worksheets/sheet1.xml", SHEET1),
            ("xl/worksheets/sheet2.xml", SHEET2),
        ])
    }

    #[test]
    fn test_first_sheet_by_default() {
        let grid = XlsxParser.parse(&sample(), "xlsx", None).unwrap();
        assert_eq!(grid, vec![vec![Cell::Text("only".to_string())]]);
    }

    #[test]
    fn test_named_sheet_with_sparse_cells() {
        let grid = XlsxParser.parse(&sample(), "xlsx", Some("Hours")).unwrap();
        assert_eq!(grid.len(), 4);
        assert_eq!(
            grid[0],
            vec![
                Cell::Text("employee".to_string()),
                Cell::Null,
                Cell::Text("hours".to_string())
            ]
        );
        assert!(grid[1].is_empty());
        assert_eq!(
            grid[2],
            vec![
                Cell::Text("Alice".to_string()),
                Cell::Text("R&D".to_string()),
                Cell::Real(7.5)
            ]
        );
        assert_eq!(grid[3], vec![Cell::Integer(1), Cell::Null, Cell::Integer(8)]);
    }

    #[test]
    fn test_missing_sheet() {
        match XlsxParser.parse(&sample(), "xlsx", Some("Nope")) {
            Err(ParseError::SheetNotFound(name)) => assert_eq!(name, "Nope"),
            other => panic!("Expected SheetNotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_corrupt_archive() {
        assert!(matches!(
            XlsxParser.parse(b"this is not a zip file", "xlsx", None),
            Err(ParseError::Spreadsheet(_))
        ));
    }

    #[test]
    fn test_missing_relationships_falls_back_to_sheet_index() {
        let bytes = workbook(&[
            ("xl/workbook.xml", WORKBOOK),
            ("xl/worksheets/sheet1.xml", SHEET1),
        ]);
        let grid = XlsxParser.parse(&bytes, "xlsx", None).unwrap();
        assert_eq!(grid.len(), 1);
    }

    #[test]
    fn test_column_index() {
        assert_eq!(column_index("A1").unwrap(), Some(0));
        assert_eq!(column_index("Z9").unwrap(), Some(25));
        assert_eq!(column_index("AA10").unwrap(), Some(26));
        assert_eq!(column_index("ab1").unwrap(), Some(27));
        assert_eq!(column_index("XFD1").unwrap(), Some(16_383));
        assert_eq!(column_index("12").unwrap(), None);
    }

    #[test]
    fn test_column_past_xfd_is_rejected() {
        assert!(matches!(column_index("XFE1"), Err(ParseError::Spreadsheet(_))));
        assert!(matches!(
            column_index("ZZZZZZZZZZZZZZZ1"),
            Err(ParseError::Spreadsheet(_))
        ));
    }

    fn single_sheet(sheet: &str) -> Vec<u8> {
        workbook(&[("xl/workbook.xml", WORKBOOK), ("xl/worksheets/sheet1.xml", sheet)])
    }

    #[test]
    fn test_oversized_cell_reference_fails_to_parse() {
        let bytes = single_sheet(
            r#"<worksheet><sheetData>
  <row r="1"><c r="ZZZZZZZZZZZZZZZ1"><v>1</v></c></row>
</sheetData></worksheet>"#,
        );
        match XlsxParser.parse(&bytes, "xlsx", None) {
            Err(ParseError::Spreadsheet(message)) => assert!(message.contains("XFD")),
            other => panic!("Expected Spreadsheet error, got {:?}", other),
        }
    }

    #[test]
    fn test_row_past_last_row_fails_to_parse() {
        for r in ["1048577", "4000000000", "99999999999999999999999"] {
            let bytes = single_sheet(&format!(
                r#"<worksheet><sheetData>
  <row r="{r}"><c><v>1</v></c></row>
</sheetData></worksheet>"#
            ));
            assert!(
                matches!(
                    XlsxParser.parse(&bytes, "xlsx", None),
                    Err(ParseError::Spreadsheet(_))
                ),
                "row {} should be rejected",
                r
            );
        }
    }

    #[test]
    fn test_unnumbered_cells_are_capped_at_xfd() {
        let cells = "<c><v>1</v></c>".repeat(MAX_COLUMNS + 1);
        let bytes = single_sheet(&format!(
            "<worksheet><sheetData><row>{}</row></sheetData></worksheet>",
            cells
        ));
        assert!(matches!(
            XlsxParser.parse(&bytes, "xlsx", None),
            Err(ParseError::Spreadsheet(_))
        ));
    }
}
