//! Parser for BYOND `.dmm` map files.
//!
//! A map file defines keyed cells (`"a" = (/turf/floor,/area/start)`) and
//! grid blocks (`(1,1,1) = {"…"}`) whose rows expand into cell coordinates.
//! Key length is fixed per file by the first key. Maps are parsed after
//! the object tree is built and serialized into the output artifact.

use indexmap::IndexMap;

use crate::{
    diagnostics::Diagnostics,
    lexer::Lexer,
    location::FileId,
    token::{Token, TokenKind, TokenValue},
};

/// One type placed in a cell, with optional variable overrides.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct MapCell {
    pub type_path: String,
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub var_overrides: IndexMap<String, serde_json::Value>,
}

/// A rectangular block of cells anchored at (x, y, z).
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct MapBlock {
    pub x: u32,
    pub y: u32,
    pub z: u32,
    pub width: u32,
    pub height: u32,
    /// Cell keys in row-major order, northernmost row first.
    pub cells: Vec<String>,
}

/// A parsed map.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DreamMap {
    pub max_x: u32,
    pub max_y: u32,
    pub max_z: u32,
    pub cell_definitions: IndexMap<String, Vec<MapCell>>,
    pub blocks: Vec<MapBlock>,
}

/// Parses one map file. `z_offset` shifts every block's z coordinate so
/// multiple maps stack; returns the map and the next free z level.
pub fn parse_map(diag: &mut Diagnostics, file: FileId, source: &str, z_offset: u32) -> Option<(DreamMap, u32)> {
    let tokens = Lexer::new(file, source.to_owned(), false, false).lex_all(diag);
    let mut parser = MapParser {
        diag,
        tokens,
        pos: 0,
        key_length: None,
    };
    parser.parse(z_offset)
}

struct MapParser<'a> {
    diag: &'a mut Diagnostics,
    tokens: Vec<Token>,
    pos: usize,
    key_length: Option<usize>,
}

impl MapParser<'_> {
    fn current(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos)?.clone();
        self.pos += 1;
        Some(token)
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.current().is_some_and(|t| t.kind == kind) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn error_here(&mut self, message: &str) {
        let loc = self.current().map_or(crate::location::Location::INTERNAL, |t| t.loc);
        self.diag.error(loc, message.to_owned());
    }

    fn parse(&mut self, z_offset: u32) -> Option<(DreamMap, u32)> {
        let mut map = DreamMap {
            max_x: 0,
            max_y: 0,
            max_z: 0,
            cell_definitions: IndexMap::new(),
            blocks: Vec::new(),
        };

        loop {
            while self.eat(TokenKind::Newline) {}
            let Some(token) = self.current() else { break };
            match token.kind {
                TokenKind::String => {
                    let key = token.text.clone();
                    self.pos += 1;
                    if self.key_length.is_none() {
                        self.key_length = Some(key.chars().count());
                    }
                    if !self.eat(TokenKind::Assign) {
                        self.error_here("Expected \"=\" after cell key");
                        return None;
                    }
                    let cells = self.parse_cell_definition()?;
                    map.cell_definitions.insert(key, cells);
                }
                TokenKind::LeftParen => {
                    let block = self.parse_block(z_offset)?;
                    map.max_x = map.max_x.max(block.x + block.width - 1);
                    map.max_y = map.max_y.max(block.y + block.height - 1);
                    map.max_z = map.max_z.max(block.z);
                    map.blocks.push(block);
                }
                _ => {
                    self.error_here("Expected a cell definition or grid block");
                    return None;
                }
            }
        }

        let next_z = map.max_z.max(z_offset) + 1;
        Some((map, next_z))
    }

    fn parse_cell_definition(&mut self) -> Option<Vec<MapCell>> {
        if !self.eat(TokenKind::LeftParen) {
            self.error_here("Expected \"(\" after cell key");
            return None;
        }
        let mut cells = Vec::new();
        loop {
            while self.eat(TokenKind::Newline) {}
            if self.eat(TokenKind::RightParen) {
                return Some(cells);
            }
            if !self.eat(TokenKind::Slash) {
                self.error_here("Expected a type path in cell definition");
                return None;
            }
            let mut elements = Vec::new();
            loop {
                match self.current() {
                    Some(t) if t.kind == TokenKind::Identifier || TokenKind::keyword(&t.text).is_some() => {
                        elements.push(t.text.clone());
                        self.pos += 1;
                    }
                    _ => break,
                }
                if !self.eat(TokenKind::Slash) {
                    break;
                }
            }
            let type_path = format!("/{}", elements.join("/"));

            let mut var_overrides = IndexMap::new();
            if self.eat(TokenKind::LeftBrace) {
                loop {
                    while self.eat(TokenKind::Semicolon) || self.eat(TokenKind::Newline) {}
                    if self.eat(TokenKind::RightBrace) {
                        break;
                    }
                    let Some(name) = self.bump() else {
                        self.error_here("Unterminated var override block");
                        return None;
                    };
                    if !self.eat(TokenKind::Assign) {
                        self.error_here("Expected \"=\" in var override");
                        return None;
                    }
                    let value = self.parse_constant()?;
                    var_overrides.insert(name.text, value);
                }
            }
            cells.push(MapCell {
                type_path,
                var_overrides,
            });

            if self.eat(TokenKind::Comma) {
                continue;
            }
        }
    }

    fn parse_constant(&mut self) -> Option<serde_json::Value> {
        let negative = self.eat(TokenKind::Minus);
        let token = self.bump()?;
        let value = match token.kind {
            TokenKind::Number => match token.value {
                Some(TokenValue::Int(i)) => serde_json::Value::from(if negative { -i } else { i }),
                Some(TokenValue::Float(f)) => serde_json::Value::from(if negative { -f } else { f }),
                _ => serde_json::Value::Null,
            },
            TokenKind::String => serde_json::Value::from(token.str_value().unwrap_or(&token.text)),
            TokenKind::Resource => serde_json::Value::from(token.text.as_str()),
            TokenKind::Null => serde_json::Value::Null,
            TokenKind::Slash => {
                let mut elements = Vec::new();
                while let Some(t) = self.current() {
                    if t.kind != TokenKind::Identifier && TokenKind::keyword(&t.text).is_none() {
                        break;
                    }
                    elements.push(t.text.clone());
                    self.pos += 1;
                    if !self.eat(TokenKind::Slash) {
                        break;
                    }
                }
                serde_json::Value::from(format!("/{}", elements.join("/")))
            }
            _ => {
                self.diag.error(token.loc, "Unsupported constant in map var override");
                return None;
            }
        };
        Some(value)
    }

    fn parse_block(&mut self, z_offset: u32) -> Option<MapBlock> {
        self.pos += 1; // (
        let x = self.parse_coordinate()?;
        self.eat(TokenKind::Comma);
        let y = self.parse_coordinate()?;
        self.eat(TokenKind::Comma);
        let z = self.parse_coordinate()?;
        if !self.eat(TokenKind::RightParen) {
            self.error_here("Expected \")\" after block coordinates");
            return None;
        }
        if !self.eat(TokenKind::Assign) {
            self.error_here("Expected \"=\" after block coordinates");
            return None;
        }
        let Some(grid) = self.bump().filter(|t| t.kind == TokenKind::String) else {
            self.error_here("Expected a grid string after block coordinates");
            return None;
        };

        let key_length = self.key_length.unwrap_or(1).max(1);
        let rows: Vec<&str> = grid.text.lines().filter(|line| !line.trim().is_empty()).collect();
        let mut cells = Vec::new();
        let mut width = 0u32;
        for row in &rows {
            let row_keys: Vec<String> = row
                .chars()
                .collect::<Vec<char>>()
                .chunks(key_length)
                .map(|chunk| chunk.iter().collect())
                .collect();
            width = width.max(u32::try_from(row_keys.len()).unwrap_or(u32::MAX));
            cells.extend(row_keys);
        }
        let height = u32::try_from(rows.len()).unwrap_or(u32::MAX);
        Some(MapBlock {
            x,
            y,
            z: z + z_offset - 1,
            width: width.max(1),
            height: height.max(1),
            cells,
        })
    }

    fn parse_coordinate(&mut self) -> Option<u32> {
        let token = self.bump()?;
        match token.value {
            Some(TokenValue::Int(i)) if i >= 1 => u32::try_from(i).ok(),
            _ => {
                self.diag.error(token.loc, "Invalid block coordinate");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn parse(source: &str) -> (Option<(DreamMap, u32)>, Diagnostics) {
        let mut diag = Diagnostics::new(100, false);
        let file = diag.files.intern("test.dmm");
        let result = parse_map(&mut diag, file, source, 1);
        (result, diag)
    }

    const SIMPLE_MAP: &str = "\"a\" = (/turf/floor,/area/start)\n\"b\" = (/turf/wall{name = \"wall\"; opacity = 1},/area/start)\n\n(1,1,1) = {\"\nab\nba\n\"}\n";

    #[test]
    fn parses_cell_definitions() {
        let (result, diag) = parse(SIMPLE_MAP);
        assert_eq!(diag.error_count(), 0);
        let (map, _) = result.unwrap();
        assert_eq!(map.cell_definitions.len(), 2);
        let wall = &map.cell_definitions["b"][0];
        assert_eq!(wall.type_path, "/turf/wall");
        assert_eq!(wall.var_overrides["name"], serde_json::Value::from("wall"));
        assert_eq!(wall.var_overrides["opacity"], serde_json::Value::from(1));
    }

    #[test]
    fn expands_grid_block() {
        let (result, _) = parse(SIMPLE_MAP);
        let (map, next_z) = result.unwrap();
        assert_eq!(map.blocks.len(), 1);
        let block = &map.blocks[0];
        assert_eq!((block.x, block.y, block.z), (1, 1, 1));
        assert_eq!((block.width, block.height), (2, 2));
        assert_eq!(block.cells, vec!["a", "b", "b", "a"]);
        assert_eq!(map.max_x, 2);
        assert_eq!(map.max_y, 2);
        assert_eq!(next_z, 2);
    }

    #[test]
    fn multi_character_keys() {
        let source = "\"aa\" = (/turf/floor)\n\"ab\" = (/turf/wall)\n(1,1,1) = {\"\naaab\nabaa\n\"}\n";
        let (result, diag) = parse(source);
        assert_eq!(diag.error_count(), 0);
        let (map, _) = result.unwrap();
        assert_eq!(map.blocks[0].cells, vec!["aa", "ab", "ab", "aa"]);
        assert_eq!(map.blocks[0].width, 2);
    }

    #[test]
    fn z_offset_shifts_blocks() {
        let mut diag = Diagnostics::new(100, false);
        let file = diag.files.intern("test.dmm");
        let (map, next_z) = parse_map(&mut diag, file, "\"a\" = (/turf)\n(1,1,1) = {\"\na\n\"}\n", 3).unwrap();
        assert_eq!(map.blocks[0].z, 3);
        assert_eq!(next_z, 4);
    }

    #[test]
    fn malformed_map_reports_error() {
        let (result, diag) = parse("\"a\" (/turf)\n");
        assert!(result.is_none());
        assert_eq!(diag.error_count(), 1);
    }
}
