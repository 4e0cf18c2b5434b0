//! Parser for `${..}` expression strings.

use thiserror::Error;

use super::{FunctionArg, SourcePosition, SourceRange, StringOrSubstitutions, StringPart, Substitution, SubstitutionKind};
use crate::value::{PathError, PropertyPath, ScalarValue};

/// Errors that can occur while parsing an expression string.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
pub enum ParseError {
  #[error("unclosed substitution starting at {line}:{column}")]
  Unclosed { line: usize, column: usize },

  #[error("unexpected {found} at {line}:{column}, expected {expected}")]
  Unexpected {
    found: String,
    expected: String,
    line: usize,
    column: usize,
  },

  #[error("unknown reference '{name}' at {line}:{column}")]
  UnknownReference { name: String, line: usize, column: usize },

  #[error("resource property must start with 'spec' or 'metadata', got '{0}'")]
  InvalidResourceSection(String),

  #[error("invalid number literal '{0}'")]
  InvalidNumber(String),

  #[error("invalid path: {0}")]
  Path(#[from] PathError),
}

/// Parse a string that may contain `${..}` expressions.
///
/// Positions in the resulting substitutions start at line 1, column 1.
pub fn parse(input: &str) -> Result<StringOrSubstitutions, ParseError> {
  parse_at(input, SourcePosition::default(), true)
}

/// Parse a string whose first character sits at `start` in the source.
///
/// Set `column_accurate` to false for multi-line string forms where the
/// column of characters after the first line is only approximate.
pub fn parse_at(input: &str, start: SourcePosition, column_accurate: bool) -> Result<StringOrSubstitutions, ParseError> {
  let mut parser = Parser {
    chars: input.chars().collect(),
    pos: 0,
    start,
    column_accurate,
  };
  parser.parse_string()
}

struct Parser {
  chars: Vec<char>,
  pos: usize,
  start: SourcePosition,
  column_accurate: bool,
}

impl Parser {
  fn parse_string(&mut self) -> Result<StringOrSubstitutions, ParseError> {
    let mut parts = Vec::new();
    let mut literal = String::new();

    while let Some(ch) = self.peek() {
      if ch == '$' && self.peek_at(1) == Some('$') && self.peek_at(2) == Some('{') {
        // Escaped: $${ -> ${
        literal.push_str("${");
        self.pos += 3;
      } else if ch == '$' && self.peek_at(1) == Some('{') {
        let open = self.pos;
        self.pos += 2;

        if !literal.is_empty() {
          parts.push(StringPart::Literal(std::mem::take(&mut literal)));
        }

        self.skip_ws();
        let sub = self.parse_expr().map_err(|e| match e {
          ParseError::Unexpected { ref found, .. } if found == "end of input" => self.unclosed(open),
          other => other,
        })?;
        self.skip_ws();
        if self.peek() != Some('}') {
          if self.peek().is_none() {
            return Err(self.unclosed(open));
          }
          return Err(self.unexpected("'}'"));
        }
        self.pos += 1;

        let mut sub = sub;
        sub.range = Some(self.range(open, self.pos));
        parts.push(StringPart::Substitution(sub));
      } else {
        literal.push(ch);
        self.pos += 1;
      }
    }

    if !literal.is_empty() {
      parts.push(StringPart::Literal(literal));
    }

    Ok(StringOrSubstitutions { parts })
  }

  fn parse_expr(&mut self) -> Result<Substitution, ParseError> {
    let start = self.pos;
    let kind = match self.peek() {
      Some('"') => SubstitutionKind::Literal(ScalarValue::String(self.parse_string_literal()?)),
      Some(c) if c.is_ascii_digit() || c == '-' => SubstitutionKind::Literal(self.parse_number()?),
      Some(c) if is_ident_start(c) => self.parse_ident_expr()?,
      _ => return Err(self.unexpected("an expression")),
    };
    Ok(Substitution {
      kind,
      range: Some(self.range(start, self.pos)),
    })
  }

  fn parse_ident_expr(&mut self) -> Result<SubstitutionKind, ParseError> {
    let ident_start = self.pos;
    let ident = self.parse_ident()?;

    if self.peek() == Some('(') {
      return self.parse_call(ident);
    }

    match ident.as_str() {
      "true" => Ok(SubstitutionKind::Literal(ScalarValue::Bool(true))),
      "false" => Ok(SubstitutionKind::Literal(ScalarValue::Bool(false))),
      "i" => Ok(SubstitutionKind::ElemIndex),
      "elem" => {
        let path = self.parse_path_tail()?;
        Ok(SubstitutionKind::Elem { path })
      }
      "variables" => {
        self.expect('.')?;
        let name = self.parse_ident()?;
        Ok(SubstitutionKind::Variable { name })
      }
      "resources" => {
        self.expect('.')?;
        let resource = self.parse_ident()?;
        let optional = self.eat('?');
        let index = self.parse_optional_index()?;
        self.expect('.')?;
        let path = PropertyPath::parse(&self.take_path_text())?;
        match path.segments().first() {
          Some(crate::value::PathSegment::Field(section)) if section == "spec" || section == "metadata" => {}
          _ => return Err(ParseError::InvalidResourceSection(path.to_string())),
        }
        Ok(SubstitutionKind::ResourceProperty {
          resource,
          index,
          path,
          optional,
        })
      }
      "datasources" => {
        self.expect('.')?;
        let data_source = self.parse_ident()?;
        self.expect('.')?;
        let field = self.parse_ident()?;
        let index = self.parse_optional_index()?;
        Ok(SubstitutionKind::DataSourceProperty {
          data_source,
          field,
          index,
        })
      }
      "children" => {
        self.expect('.')?;
        let child = self.parse_ident()?;
        self.expect('.')?;
        let export = self.parse_ident()?;
        let path = self.parse_path_tail()?;
        Ok(SubstitutionKind::ChildProperty { child, export, path })
      }
      _ => {
        let pos = self.position(ident_start);
        Err(ParseError::UnknownReference {
          name: ident,
          line: pos.line,
          column: pos.column,
        })
      }
    }
  }

  fn parse_call(&mut self, name: String) -> Result<SubstitutionKind, ParseError> {
    self.expect('(')?;
    let mut args = Vec::new();
    self.skip_ws();

    if self.eat(')') {
      return Ok(SubstitutionKind::FunctionCall { name, args });
    }

    loop {
      self.skip_ws();
      let arg_name = self.try_named_arg();
      let value = self.parse_expr()?;
      args.push(FunctionArg { name: arg_name, value });
      self.skip_ws();

      if self.eat(',') {
        continue;
      }
      if self.eat(')') {
        break;
      }
      return Err(self.unexpected("',' or ')'"));
    }

    Ok(SubstitutionKind::FunctionCall { name, args })
  }

  /// Consume `name =` if present, leaving the position untouched otherwise.
  fn try_named_arg(&mut self) -> Option<String> {
    let saved = self.pos;
    if let Some(c) = self.peek()
      && is_ident_start(c)
      && let Ok(name) = self.parse_ident()
    {
      self.skip_ws();
      if self.peek() == Some('=') && self.peek_at(1) != Some('=') {
        self.pos += 1;
        self.skip_ws();
        return Some(name);
      }
    }
    self.pos = saved;
    None
  }

  fn parse_optional_index(&mut self) -> Result<Option<usize>, ParseError> {
    if self.peek() != Some('[') {
      return Ok(None);
    }
    self.pos += 1;
    let mut digits = String::new();
    while let Some(c) = self.peek()
      && c.is_ascii_digit()
    {
      digits.push(c);
      self.pos += 1;
    }
    self.expect(']')?;
    digits.parse::<usize>().map(Some).map_err(|_| ParseError::InvalidNumber(digits))
  }

  /// Parse an optional `.a.b[0]` tail following a reference.
  fn parse_path_tail(&mut self) -> Result<PropertyPath, ParseError> {
    match self.peek() {
      Some('.') => {
        self.pos += 1;
        Ok(PropertyPath::parse(&self.take_path_text())?)
      }
      Some('[') => Ok(PropertyPath::parse(&self.take_path_text())?),
      _ => Ok(PropertyPath::root()),
    }
  }

  /// Take raw path text up to the next delimiter, honouring quoted keys.
  fn take_path_text(&mut self) -> String {
    let mut text = String::new();
    let mut quote: Option<char> = None;
    while let Some(c) = self.peek() {
      match quote {
        Some(q) if c == q => quote = None,
        Some(_) => {}
        None if c == '"' || c == '\'' => quote = Some(c),
        None if c.is_whitespace() || c == ',' || c == ')' || c == '}' => break,
        None => {}
      }
      text.push(c);
      self.pos += 1;
    }
    text
  }

  fn parse_ident(&mut self) -> Result<String, ParseError> {
    let mut ident = String::new();
    match self.peek() {
      Some(c) if is_ident_start(c) => {
        ident.push(c);
        self.pos += 1;
      }
      _ => return Err(self.unexpected("an identifier")),
    }
    while let Some(c) = self.peek()
      && (c.is_alphanumeric() || c == '_' || c == '-')
    {
      ident.push(c);
      self.pos += 1;
    }
    Ok(ident)
  }

  fn parse_string_literal(&mut self) -> Result<String, ParseError> {
    let open = self.pos;
    self.expect('"')?;
    let mut value = String::new();
    loop {
      match self.peek() {
        None => return Err(self.unclosed(open)),
        Some('"') => {
          self.pos += 1;
          return Ok(value);
        }
        Some('\\') => {
          self.pos += 1;
          match self.peek() {
            Some('n') => value.push('\n'),
            Some('t') => value.push('\t'),
            Some(c) => value.push(c),
            None => return Err(self.unclosed(open)),
          }
          self.pos += 1;
        }
        Some(c) => {
          value.push(c);
          self.pos += 1;
        }
      }
    }
  }

  fn parse_number(&mut self) -> Result<ScalarValue, ParseError> {
    let mut text = String::new();
    if self.eat('-') {
      text.push('-');
    }
    while let Some(c) = self.peek()
      && (c.is_ascii_digit() || c == '.')
    {
      text.push(c);
      self.pos += 1;
    }
    if text.contains('.') {
      text
        .parse::<f64>()
        .map(ScalarValue::Float)
        .map_err(|_| ParseError::InvalidNumber(text))
    } else {
      text
        .parse::<i64>()
        .map(ScalarValue::Int)
        .map_err(|_| ParseError::InvalidNumber(text))
    }
  }

  fn peek(&self) -> Option<char> {
    self.chars.get(self.pos).copied()
  }

  fn peek_at(&self, offset: usize) -> Option<char> {
    self.chars.get(self.pos + offset).copied()
  }

  fn eat(&mut self, expected: char) -> bool {
    if self.peek() == Some(expected) {
      self.pos += 1;
      true
    } else {
      false
    }
  }

  fn expect(&mut self, expected: char) -> Result<(), ParseError> {
    if self.eat(expected) {
      Ok(())
    } else {
      Err(self.unexpected(&format!("'{expected}'")))
    }
  }

  fn skip_ws(&mut self) {
    while let Some(c) = self.peek()
      && c.is_whitespace()
    {
      self.pos += 1;
    }
  }

  fn position(&self, offset: usize) -> SourcePosition {
    let mut line = self.start.line;
    let mut column = self.start.column;
    for &c in self.chars.iter().take(offset) {
      if c == '\n' {
        line += 1;
        column = 1;
      } else {
        column += 1;
      }
    }
    SourcePosition { line, column }
  }

  fn range(&self, start: usize, end: usize) -> SourceRange {
    let start_pos = self.position(start);
    SourceRange {
      start: start_pos,
      end: Some(self.position(end)),
      column_accurate: self.column_accurate || start_pos.line == self.start.line,
    }
  }

  fn unexpected(&self, expected: &str) -> ParseError {
    let pos = self.position(self.pos);
    ParseError::Unexpected {
      found: self.peek().map_or_else(|| "end of input".to_string(), |c| format!("'{c}'")),
      expected: expected.to_string(),
      line: pos.line,
      column: pos.column,
    }
  }

  fn unclosed(&self, open: usize) -> ParseError {
    let pos = self.position(open);
    ParseError::Unclosed {
      line: pos.line,
      column: pos.column,
    }
  }
}

fn is_ident_start(c: char) -> bool {
  c.is_alphabetic() || c == '_'
}
