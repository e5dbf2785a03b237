//! Minimal pickle (protocol 2) emitter.
//!
//! Only the opcodes needed to describe a torch state dict are supported:
//! dicts, tuples, ints, strings, booleans, `None`, globals, `REDUCE` and
//! persistent ids. No memoization is emitted, so every object is written in
//! full where it is referenced.

const PROTO: u8 = 0x80;
const STOP: u8 = b'.';
const MARK: u8 = b'(';
const NONE: u8 = b'N';
const NEWTRUE: u8 = 0x88;
const NEWFALSE: u8 = 0x89;
const BININT: u8 = b'J';
const BININT1: u8 = b'K';
const BININT2: u8 = b'M';
const LONG1: u8 = 0x8a;
const BINUNICODE: u8 = b'X';
const GLOBAL: u8 = b'c';
const EMPTY_DICT: u8 = b'}';
const EMPTY_TUPLE: u8 = b')';
const TUPLE: u8 = b't';
const TUPLE1: u8 = 0x85;
const TUPLE2: u8 = 0x86;
const TUPLE3: u8 = 0x87;
const SETITEM: u8 = b's';
const SETITEMS: u8 = b'u';
const BINPERSID: u8 = b'Q';
const REDUCE: u8 = b'R';

/// Stack-machine style pickle writer; callers push operands in the order the
/// unpickler expects them.
#[derive(Debug)]
pub struct PickleWriter {
    buf: Vec<u8>,
}

impl PickleWriter {
    pub fn new() -> Self {
        Self { buf: vec![PROTO, 2] }
    }

    pub fn none(&mut self) {
        self.buf.push(NONE);
    }

    pub fn bool(&mut self, value: bool) {
        self.buf.push(if value { NEWTRUE } else { NEWFALSE });
    }

    pub fn int(&mut self, value: i64) {
        if (0..=0xff).contains(&value) {
            self.buf.extend_from_slice(&[BININT1, value as u8]);
        } else if (0..=0xffff).contains(&value) {
            self.buf.push(BININT2);
            self.buf.extend_from_slice(&(value as u16).to_le_bytes());
        } else if i32::try_from(value).is_ok() {
            self.buf.push(BININT);
            self.buf.extend_from_slice(&(value as i32).to_le_bytes());
        } else {
            let bytes = long_bytes(value);
            self.buf.extend_from_slice(&[LONG1, bytes.len() as u8]);
            self.buf.extend_from_slice(&bytes);
        }
    }

    pub fn string(&mut self, value: &str) {
        self.buf.push(BINUNICODE);
        self.buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(value.as_bytes());
    }

    /// Push `module.name` (resolved by the unpickler's `find_class`).
    pub fn global(&mut self, module: &str, name: &str) {
        self.buf.push(GLOBAL);
        self.buf.extend_from_slice(module.as_bytes());
        self.buf.push(b'\n');
        self.buf.extend_from_slice(name.as_bytes());
        self.buf.push(b'\n');
    }

    pub fn mark(&mut self) {
        self.buf.push(MARK);
    }

    /// Build a tuple from everything pushed since the last `mark`.
    pub fn tuple_from_mark(&mut self) {
        self.buf.push(TUPLE);
    }

    pub fn empty_tuple(&mut self) {
        self.buf.push(EMPTY_TUPLE);
    }

    /// Tuple of integers, using the compact fixed-arity opcodes when possible.
    pub fn int_tuple(&mut self, values: &[i64]) {
        match values.len() {
            0 => self.empty_tuple(),
            n @ 1..=3 => {
                for &v in values {
                    self.int(v);
                }
                self.buf.push([TUPLE1, TUPLE2, TUPLE3][n - 1]);
            }
            _ => {
                self.mark();
                for &v in values {
                    self.int(v);
                }
                self.tuple_from_mark();
            }
        }
    }

    pub fn empty_dict(&mut self) {
        self.buf.push(EMPTY_DICT);
    }

    /// Pop one key/value pair into the dict below it.
    pub fn set_item(&mut self) {
        self.buf.push(SETITEM);
    }

    /// Pop all key/value pairs since the last `mark` into the dict below it.
    pub fn set_items(&mut self) {
        self.buf.push(SETITEMS);
    }

    /// Pop the top of stack and resolve it through `persistent_load`.
    pub fn persistent_id(&mut self) {
        self.buf.push(BINPERSID);
    }

    /// Call the callable below the argument tuple on top of the stack.
    pub fn reduce(&mut self) {
        self.buf.push(REDUCE);
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.buf.push(STOP);
        self.buf
    }
}

impl Default for PickleWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Minimal little-endian two's complement encoding used by `LONG1`.
fn long_bytes(value: i64) -> Vec<u8> {
    let mut bytes = value.to_le_bytes().to_vec();
    while bytes.len() > 1 {
        let last = bytes[bytes.len() - 1];
        let prev_sign = bytes[bytes.len() - 2] & 0x80;
        if (last == 0x00 && prev_sign == 0) || (last == 0xff && prev_sign != 0) {
            bytes.pop();
        } else {
            break;
        }
    }
    bytes
}
