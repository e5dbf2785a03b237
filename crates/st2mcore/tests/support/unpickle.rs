//! Stack interpreter for the pickle subset torch state dicts are written with.
//!
//! Globals, persistent ids and `REDUCE` calls are kept as data instead of
//! being resolved, so tests can assert on the exact object graph.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum PickleValue {
    None,
    Bool(bool),
    Int(i64),
    Str(String),
    /// `module.name`
    Global(String, String),
    Tuple(Vec<PickleValue>),
    /// Key/value pairs in insertion order.
    Dict(Vec<(PickleValue, PickleValue)>),
    PersistentId(Box<PickleValue>),
    Reduce { callable: Box<PickleValue>, args: Box<PickleValue> },
}

impl PickleValue {
    pub fn as_dict(&self) -> &[(PickleValue, PickleValue)] {
        match self {
            Self::Dict(items) => items,
            other => panic!("expected dict, got {other}"),
        }
    }

    pub fn as_tuple(&self) -> &[PickleValue] {
        match self {
            Self::Tuple(items) => items,
            other => panic!("expected tuple, got {other}"),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Str(s) => s,
            other => panic!("expected str, got {other}"),
        }
    }

    pub fn as_int(&self) -> i64 {
        match self {
            Self::Int(v) => *v,
            other => panic!("expected int, got {other}"),
        }
    }

    /// Integer tuple as `usize`s (shapes and strides).
    pub fn as_dims(&self) -> Vec<usize> {
        self.as_tuple().iter().map(|v| usize::try_from(v.as_int()).unwrap()).collect()
    }

    pub fn global(module: &str, name: &str) -> Self {
        Self::Global(module.to_string(), name.to_string())
    }
}

impl fmt::Display for PickleValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Bool(b) => write!(f, "{}", if *b { "True" } else { "False" }),
            Self::Int(v) => write!(f, "{v}"),
            Self::Str(s) => write!(f, "{s:?}"),
            Self::Global(m, n) => write!(f, "{m}.{n}"),
            Self::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                if items.len() == 1 {
                    write!(f, ",")?;
                }
                write!(f, ")")
            }
            Self::Dict(items) => write!(f, "{{{} items}}", items.len()),
            Self::PersistentId(pid) => write!(f, "persistent_load({pid})"),
            Self::Reduce { callable, args } => write!(f, "{callable}{args}"),
        }
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> &'a [u8] {
        let end = self.pos + n;
        assert!(end <= self.data.len(), "pickle truncated at byte {}", self.pos);
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        bytes
    }

    fn byte(&mut self) -> u8 {
        self.take(1)[0]
    }

    fn line(&mut self) -> String {
        let rest = &self.data[self.pos..];
        let len = rest.iter().position(|&b| b == b'\n').expect("unterminated GLOBAL line");
        let text = String::from_utf8(rest[..len].to_vec()).unwrap();
        self.pos += len + 1;
        text
    }
}

/// Decode a complete pickle, panicking on anything outside the supported
/// opcode set or on a malformed stack.
pub fn unpickle(data: &[u8]) -> PickleValue {
    let mut r = Reader { data, pos: 0 };
    let mut stack: Vec<PickleValue> = Vec::new();
    let mut marks: Vec<usize> = Vec::new();

    let pop = |stack: &mut Vec<PickleValue>| stack.pop().expect("pickle stack underflow");
    let pop_mark = |stack: &mut Vec<PickleValue>, marks: &mut Vec<usize>| {
        let mark = marks.pop().expect("no MARK on the stack");
        stack.split_off(mark)
    };

    loop {
        let op = r.byte();
        match op {
            0x80 => {
                let proto = r.byte();
                assert_eq!(proto, 2, "unexpected protocol");
            }
            b'.' => break,
            b'(' => marks.push(stack.len()),
            b'N' => stack.push(PickleValue::None),
            0x88 => stack.push(PickleValue::Bool(true)),
            0x89 => stack.push(PickleValue::Bool(false)),
            b'K' => stack.push(PickleValue::Int(i64::from(r.byte()))),
            b'M' => {
                let b = r.take(2);
                stack.push(PickleValue::Int(i64::from(u16::from_le_bytes([b[0], b[1]]))));
            }
            b'J' => {
                let b = r.take(4);
                let value = i32::from_le_bytes([b[0], b[1], b[2], b[3]]);
                stack.push(PickleValue::Int(i64::from(value)));
            }
            0x8a => {
                let n = usize::from(r.byte());
                let bytes = r.take(n);
                assert!(n <= 8, "LONG1 wider than i64");
                let negative = bytes.last().is_some_and(|b| b & 0x80 != 0);
                let mut buf = [if negative { 0xff } else { 0 }; 8];
                buf[..n].copy_from_slice(bytes);
                stack.push(PickleValue::Int(i64::from_le_bytes(buf)));
            }
            b'X' => {
                let b = r.take(4);
                let len = u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize;
                let text = String::from_utf8(r.take(len).to_vec()).unwrap();
                stack.push(PickleValue::Str(text));
            }
            b'c' => {
                let module = r.line();
                let name = r.line();
                stack.push(PickleValue::Global(module, name));
            }
            b'}' => stack.push(PickleValue::Dict(Vec::new())),
            b')' => stack.push(PickleValue::Tuple(Vec::new())),
            b't' => {
                let items = pop_mark(&mut stack, &mut marks);
                stack.push(PickleValue::Tuple(items));
            }
            0x85..=0x87 => {
                let n = usize::from(op - 0x84);
                assert!(stack.len() >= n, "pickle stack underflow");
                let items = stack.split_off(stack.len() - n);
                stack.push(PickleValue::Tuple(items));
            }
            b's' => {
                let value = pop(&mut stack);
                let key = pop(&mut stack);
                match stack.last_mut() {
                    Some(PickleValue::Dict(items)) => items.push((key, value)),
                    other => panic!("SETITEM target is not a dict: {other:?}"),
                }
            }
            b'u' => {
                let flat = pop_mark(&mut stack, &mut marks);
                assert!(flat.len() % 2 == 0, "SETITEMS with an odd item count");
                let mut flat = flat.into_iter();
                match stack.last_mut() {
                    Some(PickleValue::Dict(items)) => {
                        while let (Some(k), Some(v)) = (flat.next(), flat.next()) {
                            items.push((k, v));
                        }
                    }
                    other => panic!("SETITEMS target is not a dict: {other:?}"),
                }
            }
            b'Q' => {
                let pid = pop(&mut stack);
                stack.push(PickleValue::PersistentId(Box::new(pid)));
            }
            b'R' => {
                let args = pop(&mut stack);
                let callable = pop(&mut stack);
                stack.push(PickleValue::Reduce {
                    callable: Box::new(callable),
                    args: Box::new(args),
                });
            }
            other => panic!("unsupported opcode 0x{other:02x} at byte {}", r.pos - 1),
        }
    }

    assert_eq!(r.pos, data.len(), "trailing bytes after STOP");
    assert!(marks.is_empty(), "unbalanced MARK");
    assert_eq!(stack.len(), 1, "pickle left {} objects on the stack", stack.len());
    pop(&mut stack)
}
