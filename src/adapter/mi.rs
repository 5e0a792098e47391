//! Parser for gdb's MI3 machine interface output. One line in, one
//! [`Record`] out; values are the MI grammar's consts, tuples and
//! lists.

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Result(ResultRecord),
    Async(AsyncRecord),
    /// Console/target/log stream output, unescaped.
    Stream(StreamKind, String),
    /// The `(gdb)` ready prompt.
    Prompt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Console,
    Target,
    Log,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultClass {
    Done,
    Running,
    Connected,
    Error,
    Exit,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResultRecord {
    pub class: ResultClass,
    pub results: Results,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncKind {
    /// `*`: execution state changes, most importantly `stopped`.
    Exec,
    /// `+`: ongoing status.
    Status,
    /// `=`: notifications such as `breakpoint-created`.
    Notify,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AsyncRecord {
    pub kind: AsyncKind,
    pub class: String,
    pub results: Results,
}

pub type Results = Vec<(String, Value)>;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Const(String),
    Tuple(Results),
    List(Vec<Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Const(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&Results> {
        match self {
            Value::Tuple(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(v) => Some(v),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_tuple().and_then(|r| lookup(r, key))
    }

    /// `"0x601040"` → 0x601040. Also accepts plain decimal.
    pub fn as_u64(&self) -> Option<u64> {
        let s = self.as_str()?;
        if let Some(hex) = s.strip_prefix("0x") {
            u64::from_str_radix(hex, 16).ok()
        } else {
            s.parse().ok()
        }
    }
}

pub fn lookup<'a>(results: &'a Results, key: &str) -> Option<&'a Value> {
    results.iter().find(|(k, _)| k == key).map(|(_, v)| v)
}

/// Parse one line of MI output. The caller strips the newline.
pub fn parse_line(line: &str) -> Result<Record> {
    // gdb may prefix a command token; we never send tokens, but be
    // lenient about digits anyway
    let line = line.trim_start_matches(|c: char| c.is_ascii_digit());

    if line.starts_with("(gdb)") {
        return Ok(Record::Prompt);
    }

    let mut p = Parser::new(line);
    match p.next_char()? {
        '^' => {
            let class = match p.take_class()?.as_str() {
                "done" => ResultClass::Done,
                "running" => ResultClass::Running,
                "connected" => ResultClass::Connected,
                "error" => ResultClass::Error,
                "exit" => ResultClass::Exit,
                other => {
                    return Err(protocol(format!("unknown result class '{}'", other)))
                }
            };
            let results = p.take_results()?;
            Ok(Record::Result(ResultRecord { class, results }))
        }
        c @ ('*' | '+' | '=') => {
            let kind = match c {
                '*' => AsyncKind::Exec,
                '+' => AsyncKind::Status,
                _ => AsyncKind::Notify,
            };
            let class = p.take_class()?;
            let results = p.take_results()?;
            Ok(Record::Async(AsyncRecord {
                kind,
                class,
                results,
            }))
        }
        c @ ('~' | '@' | '&') => {
            let kind = match c {
                '~' => StreamKind::Console,
                '@' => StreamKind::Target,
                _ => StreamKind::Log,
            };
            let text = p.take_cstring()?;
            Ok(Record::Stream(kind, text))
        }
        other => Err(protocol(format!(
            "unexpected record start '{}' in {:?}",
            other, line
        ))),
    }
}

fn protocol(msg: String) -> Error {
    Error::DebuggerProtocolError(msg)
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(s: &'a str) -> Self {
        Parser {
            bytes: s.as_bytes(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn next_char(&mut self) -> Result<char> {
        let b = self
            .peek()
            .ok_or_else(|| protocol("unexpected end of record".into()))?;
        self.pos += 1;
        Ok(b as char)
    }

    fn expect(&mut self, want: u8) -> Result<()> {
        match self.peek() {
            Some(b) if b == want => {
                self.pos += 1;
                Ok(())
            }
            other => Err(protocol(format!(
                "expected '{}', found {:?}",
                want as char,
                other.map(|b| b as char)
            ))),
        }
    }

    /// Identifier after the record marker: `done`, `stopped`,
    /// `breakpoint-created`, ...
    fn take_class(&mut self) -> Result<String> {
        let start = self.pos;
        while matches!(self.peek(), Some(b) if b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(protocol("empty record class".into()));
        }
        Ok(String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned())
    }

    /// `,name=value` repetitions until end of line.
    fn take_results(&mut self) -> Result<Results> {
        let mut results = Vec::new();
        while self.peek() == Some(b',') {
            self.pos += 1;
            results.push(self.take_named()?);
        }
        Ok(results)
    }

    fn take_named(&mut self) -> Result<(String, Value)> {
        let name = self.take_identifier()?;
        self.expect(b'=')?;
        let value = self.take_value()?;
        Ok((name, value))
    }

    fn take_identifier(&mut self) -> Result<String> {
        let start = self.pos;
        while matches!(self.peek(), Some(b) if b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(protocol("empty identifier".into()));
        }
        Ok(String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned())
    }

    fn take_value(&mut self) -> Result<Value> {
        match self.peek() {
            Some(b'"') => Ok(Value::Const(self.take_cstring()?)),
            Some(b'{') => {
                self.pos += 1;
                let mut results = Vec::new();
                if self.peek() != Some(b'}') {
                    results.push(self.take_named()?);
                    while self.peek() == Some(b',') {
                        self.pos += 1;
                        results.push(self.take_named()?);
                    }
                }
                self.expect(b'}')?;
                Ok(Value::Tuple(results))
            }
            Some(b'[') => {
                self.pos += 1;
                let mut items = Vec::new();
                if self.peek() != Some(b']') {
                    items.push(self.take_list_item()?);
                    while self.peek() == Some(b',') {
                        self.pos += 1;
                        items.push(self.take_list_item()?);
                    }
                }
                self.expect(b']')?;
                Ok(Value::List(items))
            }
            other => Err(protocol(format!(
                "expected value, found {:?}",
                other.map(|b| b as char)
            ))),
        }
    }

    /// List items are plain values or `name=value`; named items are
    /// wrapped into single-entry tuples so lists stay homogeneous.
    fn take_list_item(&mut self) -> Result<Value> {
        match self.peek() {
            Some(b'"') | Some(b'{') | Some(b'[') => self.take_value(),
            _ => {
                let named = self.take_named()?;
                Ok(Value::Tuple(vec![named]))
            }
        }
    }

    fn take_cstring(&mut self) -> Result<String> {
        self.expect(b'"')?;
        let mut out = String::new();
        loop {
            match self.next_char()? {
                '"' => break,
                '\\' => match self.next_char()? {
                    'n' => out.push('\n'),
                    't' => out.push('\t'),
                    'r' => out.push('\r'),
                    '"' => out.push('"'),
                    '\\' => out.push('\\'),
                    // octal escapes from gdb's C-string quoting
                    c @ '0'..='7' => {
                        let mut v = c as u32 - '0' as u32;
                        for _ in 0..2 {
                            match self.peek() {
                                Some(b @ b'0'..=b'7') => {
                                    v = v * 8 + (b - b'0') as u32;
                                    self.pos += 1;
                                }
                                _ => break,
                            }
                        }
                        out.push((v as u8) as char);
                    }
                    c => {
                        out.push('\\');
                        out.push(c);
                    }
                },
                c => out.push(c),
            }
        }
        Ok(out)
    }
}
