//! Incremental extraction of one string field from JSON that is still being
//! streamed, e.g. `{"reply": "Hel` ... `lo"}` arriving over many deltas.
//!
//! Each call to [`ReplyExtractor::push`] consumes only the new text, so the
//! cost is linear in the total output.

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    /// Outside any string, waiting for a key to open.
    SeekKey,
    InKey { buf: String, escaped: bool },
    AfterKey { matched: bool },
    AfterColon { matched: bool },
    /// Inside a string value we are not interested in.
    SkipString { escaped: bool },
    InValue,
    Escape,
    Unicode { digits: String },
    Done,
}

/// Streams the decoded value of a top-level JSON string field.
#[derive(Debug, Clone)]
pub struct ReplyExtractor {
    field: String,
    state: State,
    high_surrogate: Option<u32>,
    value: String,
}

impl ReplyExtractor {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            state: State::SeekKey,
            high_surrogate: None,
            value: String::new(),
        }
    }

    /// Feed the next piece of raw JSON text; returns newly decoded value text.
    pub fn push(&mut self, chunk: &str) -> String {
        let mut out = String::new();
        for ch in chunk.chars() {
            self.step(ch, &mut out);
            if self.state == State::Done {
                break;
            }
        }
        self.value.push_str(&out);
        out
    }

    /// Everything decoded so far.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// The closing quote of the field has been seen.
    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    fn step(&mut self, ch: char, out: &mut String) {
        let state = std::mem::replace(&mut self.state, State::Done);
        self.state = match state {
            State::SeekKey => match ch {
                '"' => State::InKey {
                    buf: String::new(),
                    escaped: false,
                },
                _ => State::SeekKey,
            },
            State::InKey { mut buf, escaped } => match (ch, escaped) {
                ('"', false) => State::AfterKey {
                    matched: buf == self.field,
                },
                ('\\', false) => {
                    buf.push(ch);
                    State::InKey { buf, escaped: true }
                }
                _ => {
                    buf.push(ch);
                    State::InKey {
                        buf,
                        escaped: false,
                    }
                }
            },
            State::AfterKey { matched } => match ch {
                ':' => State::AfterColon { matched },
                c if c.is_whitespace() => State::AfterKey { matched },
                // The string was a value, not a key.
                _ => State::SeekKey,
            },
            State::AfterColon { matched } => match ch {
                '"' if matched => State::InValue,
                '"' => State::SkipString { escaped: false },
                c if c.is_whitespace() => State::AfterColon { matched },
                _ => State::SeekKey,
            },
            State::SkipString { escaped } => match (ch, escaped) {
                ('"', false) => State::SeekKey,
                ('\\', false) => State::SkipString { escaped: true },
                _ => State::SkipString { escaped: false },
            },
            State::InValue => match ch {
                '"' => State::Done,
                '\\' => State::Escape,
                _ => {
                    self.emit(ch, out);
                    State::InValue
                }
            },
            State::Escape => {
                let decoded = match ch {
                    'n' => Some('\n'),
                    't' => Some('\t'),
                    'r' => Some('\r'),
                    'b' => Some('\u{8}'),
                    'f' => Some('\u{c}'),
                    'u' => None,
                    other => Some(other),
                };
                match decoded {
                    Some(c) => {
                        self.emit(c, out);
                        State::InValue
                    }
                    None => State::Unicode {
                        digits: String::with_capacity(4),
                    },
                }
            }
            State::Unicode { mut digits } => {
                digits.push(ch);
                if digits.len() < 4 {
                    State::Unicode { digits }
                } else {
                    if let Ok(code) = u32::from_str_radix(&digits, 16) {
                        self.emit_code_unit(code, out);
                    } else {
                        out.push(char::REPLACEMENT_CHARACTER);
                    }
                    State::InValue
                }
            }
            State::Done => State::Done,
        };
    }

    fn emit(&mut self, ch: char, out: &mut String) {
        if self.high_surrogate.take().is_some() {
            out.push(char::REPLACEMENT_CHARACTER);
        }
        out.push(ch);
    }

    fn emit_code_unit(&mut self, code: u32, out: &mut String) {
        match code {
            0xD800..=0xDBFF => {
                if self.high_surrogate.replace(code).is_some() {
                    out.push(char::REPLACEMENT_CHARACTER);
                }
            }
            0xDC00..=0xDFFF => match self.high_surrogate.take() {
                Some(high) => {
                    let combined = 0x10000 + ((high - 0xD800) << 10) + (code - 0xDC00);
                    out.push(char::from_u32(combined).unwrap_or(char::REPLACEMENT_CHARACTER));
                }
                None => out.push(char::REPLACEMENT_CHARACTER),
            },
            _ => {
                let ch = char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER);
                self.emit(ch, out);
            }
        }
    }
}
