use csv::ReaderBuilder;

use super::{Cell, Grid, TableParser};
use crate::error::ParseError;

/// Parser for `.csv`, `.tsv` and `.txt` files.
pub struct DelimitedParser;

impl TableParser for DelimitedParser {
    fn parse(&self, bytes: &[u8], extension: &str, _sheet: Option<&str>) -> Result<Grid, ParseError> {
        let text = decode(bytes);
        let delimiter = match extension {
            "tsv" => b'\t',
            "txt" => sniff_delimiter(&text),
            _ => b',',
        };
        parse_with_delimiter(&text, delimiter)
    }

    fn supports(&self, extension: &str) -> bool {
        matches!(extension, "csv" | "tsv" | "txt")
    }
}

/// Decodes file bytes as UTF-8, dropping a BOM and replacing invalid sequences.
fn decode(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// Picks the most frequent candidate delimiter on the first non-blank line.
fn sniff_delimiter(text: &str) -> u8 {
    let first_line = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    let candidates = [b'\t', b',', b';', b'|'];

    candidates
        .iter()
        .map(|&d| (d, first_line.bytes().filter(|&b| b == d).count()))
        .filter(|&(_, count)| count > 0)
        .max_by_key(|&(_, count)| count)
        .map(|(d, _)| d)
        .unwrap_or(b',')
}

fn parse_with_delimiter(text: &str, delimiter: u8) -> Result<Grid, ParseError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(delimiter)
        .from_reader(text.as_bytes());

    let mut grid = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| ParseError::Delimited(e.to_string()))?;
        grid.push(record.iter().map(Cell::infer).collect());
    }
    Ok(grid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(bytes: &[u8], extension: &str) -> Grid {
        DelimitedParser.parse(bytes, extension, None).unwrap()
    }

    #[test]
    fn test_csv_with_quotes_and_ragged_rows() {
        let grid = parse(b"name,note\n\"Smith, J\",\"said \"\"hi\"\"\"\nBob\n", "csv");
        assert_eq!(grid.len(), 3);
        assert_eq!(grid[1][0], Cell::Text("Smith, J".to_string()));
        assert_eq!(grid[1][1], Cell::Text("said \"hi\"".to_string()));
        assert_eq!(grid[2].len(), 1);
    }

    #[test]
    fn test_tsv() {
        let grid = parse(b"a\tb\n1\t2.5\n", "tsv");
        assert_eq!(grid[1], vec![Cell::Integer(1), Cell::Real(2.5)]);
    }

    #[test]
    fn test_txt_sniffs_semicolon() {
        let grid = parse(b"a;b;c\n1;2;3\n", "txt");
        assert_eq!(grid[0].len(), 3);
        assert_eq!(grid[1][2], Cell::Integer(3));
    }

    #[test]
    fn test_bom_is_stripped() {
        let grid = parse(b"\xEF\xBB\xBFid,name\n1,x\n", "csv");
        assert_eq!(grid[0][0], Cell::Text("id".to_string()));
    }

    #[test]
    fn test_sniff_defaults_to_comma() {
        assert_eq!(sniff_delimiter("single column"), b',');
        assert_eq!(sniff_delimiter("\n\na|b|c"), b'|');
        assert_eq!(sniff_delimiter("a\tb,c\td"), b'\t');
    }

    #[test]
    fn test_empty_input() {
        assert!(parse(b"", "csv").is_empty());
    }
}
