//! Parser for the textual type declaration file (`.ost`).
//!
//! The declaration drives the import side: it names types, the tag
//! conditions classifying raw objects, the feature slots each type carries
//! and the behaviour flags. A minimal example:
//!
//! ```text
//! OST
//!
//! MAX_SPEED "DE:urban" = 50
//!
//! GRADE 1 { "asphalt" "paved" }
//!
//! TYPE highway_residential
//!   = WAY ("highway" == "residential")
//!     {Name, Ref, Access, MaxSpeed, Grade}
//!     PATH ROUTE[foot, bicycle, car] PIN_WAY
//!   GROUP highway
//!
//! END
//! ```

use super::{ObjectKind, SpecialType, TagCondition, TypeConfig, TypeInfo};
use crate::Vehicle;
use crate::types::feature::FeatureKind;
use enumset::EnumSet;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OstError {
    #[error("Cannot read '{path}': {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Line {line}: {message}")]
    Parse { line: usize, message: String },
    #[error(transparent)]
    Config(#[from] super::TypeConfigError),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Text(String),
    Number(u64),
    Symbol(char),
    EqualsEquals,
}

struct Tokenizer<'a> {
    input: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
}

impl<'a> Tokenizer<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input: input.chars().peekable(),
            line: 1,
        }
    }

    fn error(&self, message: impl Into<String>) -> OstError {
        OstError::Parse {
            line: self.line,
            message: message.into(),
        }
    }

    fn tokenize(mut self) -> Result<Vec<(usize, Token)>, OstError> {
        let mut tokens = Vec::new();

        while let Some(&c) = self.input.peek() {
            match c {
                '\n' => {
                    self.line += 1;
                    self.input.next();
                }
                c if c.is_whitespace() => {
                    self.input.next();
                }
                '/' => {
                    self.input.next();
                    if self.input.peek() == Some(&'/') {
                        for c in self.input.by_ref() {
                            if c == '\n' {
                                self.line += 1;
                                break;
                            }
                        }
                    } else {
                        return Err(self.error("unexpected '/'"));
                    }
                }
                '"' => {
                    self.input.next();
                    let mut text = String::new();
                    loop {
                        match self.input.next() {
                            Some('"') => break,
                            Some('\n') | None => {
                                return Err(self.error("unterminated string"));
                            }
                            Some(c) => text.push(c),
                        }
                    }
                    tokens.push((self.line, Token::Text(text)));
                }
                '=' => {
                    self.input.next();
                    if self.input.peek() == Some(&'=') {
                        self.input.next();
                        tokens.push((self.line, Token::EqualsEquals));
                    } else {
                        tokens.push((self.line, Token::Symbol('=')));
                    }
                }
                '(' | ')' | '{' | '}' | '[' | ']' | ',' | '!' => {
                    self.input.next();
                    tokens.push((self.line, Token::Symbol(c)));
                }
                c if c.is_ascii_digit() => {
                    let mut number = 0u64;
                    while let Some(&d) = self.input.peek() {
                        if let Some(digit) = d.to_digit(10) {
                            number = number * 10 + u64::from(digit);
                            self.input.next();
                        } else {
                            break;
                        }
                    }
                    tokens.push((self.line, Token::Number(number)));
                }
                c if c.is_alphabetic() || c == '_' => {
                    let mut ident = String::new();
                    while let Some(&d) = self.input.peek() {
                        if d.is_alphanumeric() || d == '_' || d == ':' {
                            ident.push(d);
                            self.input.next();
                        } else {
                            break;
                        }
                    }
                    tokens.push((self.line, Token::Ident(ident)));
                }
                other => {
                    return Err(self.error(format!("unexpected character '{other}'")));
                }
            }
        }

        Ok(tokens)
    }
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    config: TypeConfig,
}

impl Parser {
    fn error_at(&self, message: impl Into<String>) -> OstError {
        // Most error sites consume the offending token first.
        let index = self
            .pos
            .saturating_sub(1)
            .min(self.tokens.len().saturating_sub(1));
        let line = self.tokens.get(index).map_or(0, |(line, _)| *line);
        OstError::Parse {
            line,
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn next(&mut self) -> Result<Token, OstError> {
        let token = self
            .tokens
            .get(self.pos)
            .map(|(_, t)| t.clone())
            .ok_or_else(|| self.error_at("unexpected end of file"))?;
        self.pos += 1;
        Ok(token)
    }

    fn expect_symbol(&mut self, symbol: char) -> Result<(), OstError> {
        match self.next()? {
            Token::Symbol(c) if c == symbol => Ok(()),
            other => Err(self.error_at(format!("expected '{symbol}', found {other:?}"))),
        }
    }

    fn expect_ident(&mut self) -> Result<String, OstError> {
        match self.next()? {
            Token::Ident(ident) => Ok(ident),
            other => Err(self.error_at(format!("expected identifier, found {other:?}"))),
        }
    }

    fn expect_text(&mut self) -> Result<String, OstError> {
        match self.next()? {
            Token::Text(text) => Ok(text),
            other => Err(self.error_at(format!("expected string, found {other:?}"))),
        }
    }

    fn expect_number(&mut self) -> Result<u64, OstError> {
        match self.next()? {
            Token::Number(n) => Ok(n),
            other => Err(self.error_at(format!("expected number, found {other:?}"))),
        }
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if matches!(self.peek(), Some(Token::Ident(ident)) if ident == keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse(mut self) -> Result<TypeConfig, OstError> {
        let start = self.expect_ident()?;
        if start != "OST" {
            return Err(self.error_at("declaration must start with OST"));
        }

        loop {
            let keyword = self.expect_ident()?;
            match keyword.as_str() {
                "END" => break,
                "MAX_SPEED" => {
                    let alias = self.expect_text()?;
                    self.expect_symbol('=')?;
                    let speed = self.expect_number()?;
                    self.config
                        .register_max_speed_alias(&alias, speed.min(255) as u8);
                }
                "GRADE" => {
                    let grade = self.expect_number()?;
                    self.expect_symbol('{')?;
                    while let Some(Token::Text(_)) = self.peek() {
                        let surface = self.expect_text()?;
                        self.config
                            .register_surface_grade(&surface, grade.min(5) as u8);
                    }
                    self.expect_symbol('}')?;
                }
                "TYPE" => {
                    self.parse_type()?;
                }
                other => {
                    return Err(self.error_at(format!("unexpected keyword '{other}'")));
                }
            }
        }

        Ok(self.config)
    }

    fn parse_type(&mut self) -> Result<(), OstError> {
        let name = self.expect_ident()?;
        self.expect_symbol('=')?;

        let mut info = TypeInfo::new(name);

        // Condition groups: SCOPE+ (expr), separated by OR.
        loop {
            let mut scope: EnumSet<ObjectKind> = EnumSet::empty();
            loop {
                if self.eat_keyword("NODE") {
                    scope |= ObjectKind::Node;
                    info = info.with_node();
                } else if self.eat_keyword("WAY") {
                    scope |= ObjectKind::Way;
                    info = info.with_way();
                } else if self.eat_keyword("AREA") {
                    scope |= ObjectKind::Area;
                    info = info.with_area();
                } else if self.eat_keyword("RELATION") {
                    scope |= ObjectKind::Relation;
                    info = info.with_relation();
                } else {
                    break;
                }
            }

            if scope.is_empty() {
                return Err(self.error_at("expected NODE, WAY, AREA or RELATION"));
            }

            self.expect_symbol('(')?;
            let condition = self.parse_or()?;
            self.expect_symbol(')')?;

            info = info.with_condition(scope, condition);

            if !self.eat_keyword("OR") {
                break;
            }
        }

        // Feature list.
        if matches!(self.peek(), Some(Token::Symbol('{'))) {
            self.expect_symbol('{')?;
            loop {
                let feature_name = self.expect_ident()?;
                let kind = FeatureKind::from_name(&feature_name).ok_or_else(|| {
                    self.error_at(format!("unknown feature '{feature_name}'"))
                })?;
                info = info.with_feature(kind);

                match self.next()? {
                    Token::Symbol(',') => {}
                    Token::Symbol('}') => break,
                    other => {
                        return Err(self.error_at(format!("expected ',' or '}}', found {other:?}")));
                    }
                }
            }
        }

        // Options.
        loop {
            match self.peek() {
                Some(Token::Ident(ident)) => match ident.as_str() {
                    "PATH" => {
                        self.pos += 1;
                        info = info.with_path();
                    }
                    "ROUTE" => {
                        self.pos += 1;
                        self.expect_symbol('[')?;
                        loop {
                            let vehicle = self.expect_ident()?;
                            info = match vehicle.as_str() {
                                "foot" => info.with_route(Vehicle::Foot),
                                "bicycle" => info.with_route(Vehicle::Bicycle),
                                "car" => info.with_route(Vehicle::Car),
                                other => {
                                    return Err(
                                        self.error_at(format!("unknown vehicle '{other}'"))
                                    );
                                }
                            };
                            match self.next()? {
                                Token::Symbol(',') => {}
                                Token::Symbol(']') => break,
                                other => {
                                    return Err(self
                                        .error_at(format!("expected ',' or ']', found {other:?}")));
                                }
                            }
                        }
                    }
                    "OPTIMIZE_LOW_ZOOM" => {
                        self.pos += 1;
                        info = info.with_optimize_low_zoom();
                    }
                    "PIN_WAY" => {
                        self.pos += 1;
                        info = info.with_pin_way();
                    }
                    "MERGE_AREAS" => {
                        self.pos += 1;
                        info = info.with_merge_areas();
                    }
                    "IGNORE_SEALAND" => {
                        self.pos += 1;
                        info = info.with_ignore_sea_land();
                    }
                    "IGNORE" => {
                        self.pos += 1;
                        info = info.with_ignore();
                    }
                    "ADDRESS" => {
                        self.pos += 1;
                        info = info.with_index_as_address();
                    }
                    "LOCATION" => {
                        self.pos += 1;
                        info = info.with_index_as_location();
                    }
                    "ADMIN_REGION" => {
                        self.pos += 1;
                        info = info.with_index_as_region();
                    }
                    "POI" => {
                        self.pos += 1;
                        info = info.with_index_as_poi();
                    }
                    "MULTIPOLYGON" => {
                        self.pos += 1;
                        info = info.with_special(SpecialType::Multipolygon);
                    }
                    "ROUTE_MASTER" => {
                        self.pos += 1;
                        info = info.with_special(SpecialType::RouteMaster);
                    }
                    "ROUTE_SPECIAL" => {
                        self.pos += 1;
                        info = info.with_special(SpecialType::Route);
                    }
                    "LANES" => {
                        self.pos += 1;
                        self.expect_symbol('(')?;
                        let lanes = self.expect_number()?;
                        self.expect_symbol(',')?;
                        let oneway_lanes = self.expect_number()?;
                        self.expect_symbol(')')?;
                        info = info.with_lanes(lanes.min(255) as u8, oneway_lanes.min(255) as u8);
                    }
                    "GROUP" => {
                        self.pos += 1;
                        let group = self.expect_ident()?;
                        info = info.with_group(group);
                    }
                    "DESC" => {
                        self.pos += 1;
                        let language = self.expect_ident()?;
                        let text = self.expect_text()?;
                        info = info.with_description(language, text);
                    }
                    // Next top-level declaration.
                    "TYPE" | "END" | "MAX_SPEED" | "GRADE" => break,
                    other => {
                        return Err(self.error_at(format!("unknown option '{other}'")));
                    }
                },
                _ => break,
            }
        }

        self.config.register_type(info)?;
        Ok(())
    }

    fn parse_or(&mut self) -> Result<TagCondition, OstError> {
        let mut terms = vec![self.parse_and()?];
        while self.eat_keyword("OR") {
            terms.push(self.parse_and()?);
        }
        Ok(if terms.len() == 1 {
            terms.pop().expect("one term")
        } else {
            TagCondition::Or(terms)
        })
    }

    fn parse_and(&mut self) -> Result<TagCondition, OstError> {
        let mut factors = vec![self.parse_factor()?];
        while self.eat_keyword("AND") {
            factors.push(self.parse_factor()?);
        }
        Ok(if factors.len() == 1 {
            factors.pop().expect("one factor")
        } else {
            TagCondition::And(factors)
        })
    }

    fn parse_factor(&mut self) -> Result<TagCondition, OstError> {
        match self.next()? {
            Token::Symbol('!') => Ok(TagCondition::Not(Box::new(self.parse_factor()?))),
            Token::Symbol('(') => {
                let inner = self.parse_or()?;
                self.expect_symbol(')')?;
                Ok(inner)
            }
            Token::Text(key) => {
                let tag = self.config.register_tag(&key);
                match self.peek() {
                    Some(Token::EqualsEquals) => {
                        self.pos += 1;
                        let value = self.expect_text()?;
                        Ok(TagCondition::Equals { tag, value })
                    }
                    Some(Token::Ident(ident)) if ident == "IN" => {
                        self.pos += 1;
                        self.expect_symbol('[')?;
                        let mut values = Vec::new();
                        loop {
                            values.push(self.expect_text()?);
                            match self.next()? {
                                Token::Symbol(',') => {}
                                Token::Symbol(']') => break,
                                other => {
                                    return Err(self
                                        .error_at(format!("expected ',' or ']', found {other:?}")));
                                }
                            }
                        }
                        Ok(TagCondition::OneOf { tag, values })
                    }
                    Some(Token::Ident(ident)) if ident == "EXISTS" => {
                        self.pos += 1;
                        Ok(TagCondition::Exists { tag })
                    }
                    _ => Err(self.error_at("expected '==', 'IN' or 'EXISTS' after tag key")),
                }
            }
            other => Err(self.error_at(format!("unexpected token {other:?} in condition"))),
        }
    }
}

pub fn parse_str(input: &str) -> Result<TypeConfig, OstError> {
    let tokens = Tokenizer::new(input).tokenize()?;
    Parser {
        tokens,
        pos: 0,
        config: TypeConfig::new(),
    }
    .parse()
}

pub fn parse_file(path: impl AsRef<Path>) -> Result<TypeConfig, OstError> {
    let path = path.as_ref();
    let input = std::fs::read_to_string(path).map_err(|source| OstError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_str(&input)
}
