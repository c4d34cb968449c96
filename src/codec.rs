//! Conversion between holding register words and typed values.
//!
//! A 32-bit value spans two consecutive registers. Which of the two carries
//! the high half is vendor specific; [`WordOrder::LowWordFirst`] (the low
//! address register holds the low 16 bits) is what the supported sensor
//! families use. Getting the order wrong does not fail, it silently yields a
//! different number, so every conversion goes through [`WordOrder`].

use std::fmt;

/// Placement of the two 16-bit halves of a 32-bit value in a register pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WordOrder {
    /// `words[0]` holds bits 0..16, `words[1]` holds bits 16..32.
    #[default]
    LowWordFirst,
    /// `words[0]` holds bits 16..32, `words[1]` holds bits 0..16.
    HighWordFirst,
}

impl fmt::Display for WordOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WordOrder::LowWordFirst => "low-word-first",
            WordOrder::HighWordFirst => "high-word-first",
        })
    }
}

impl WordOrder {
    fn combine(self, words: [u16; 2]) -> u32 {
        let (high, low) = match self {
            WordOrder::LowWordFirst => (words[1], words[0]),
            WordOrder::HighWordFirst => (words[0], words[1]),
        };
        ((high as u32) << 16) | low as u32
    }

    fn split(self, value: u32) -> [u16; 2] {
        let high = (value >> 16) as u16;
        let low = (value & 0xFFFF) as u16;
        match self {
            WordOrder::LowWordFirst => [low, high],
            WordOrder::HighWordFirst => [high, low],
        }
    }

    pub fn decode_int32(self, words: [u16; 2]) -> i32 {
        self.combine(words) as i32
    }

    pub fn encode_int32(self, value: i32) -> [u16; 2] {
        self.split(value as u32)
    }

    /// The two words are laid out as big-endian halves (high word first) and
    /// the resulting four bytes are read as a big-endian IEEE-754 single.
    pub fn decode_float32(self, words: [u16; 2]) -> f32 {
        f32::from_be_bytes(self.combine(words).to_be_bytes())
    }

    pub fn encode_float32(self, value: f32) -> [u16; 2] {
        self.split(u32::from_be_bytes(value.to_be_bytes()))
    }
}

/// A single register read decodes as a plain unsigned value.
pub fn decode_u16(word: u16) -> u16 {
    word
}

pub fn decode_int32(words: [u16; 2]) -> i32 {
    WordOrder::LowWordFirst.decode_int32(words)
}

pub fn encode_int32(value: i32) -> [u16; 2] {
    WordOrder::LowWordFirst.encode_int32(value)
}

pub fn decode_float32(words: [u16; 2]) -> f32 {
    WordOrder::LowWordFirst.decode_float32(words)
}

pub fn encode_float32(value: f32) -> [u16; 2] {
    WordOrder::LowWordFirst.encode_float32(value)
}

/// Encoding of a value held in one or two holding registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    U16,
    I32,
    F32,
}

impl ValueKind {
    pub const fn word_count(self) -> u16 {
        match self {
            ValueKind::U16 => 1,
            ValueKind::I32 | ValueKind::F32 => 2,
        }
    }

    /// Picks the integer encoding for a raw register count.
    pub fn int_for_count(count: u16) -> Option<Self> {
        match count {
            1 => Some(ValueKind::U16),
            2 => Some(ValueKind::I32),
            _ => None,
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ValueKind::U16 => "u16",
            ValueKind::I32 => "i32",
            ValueKind::F32 => "f32",
        })
    }
}

/// A decoded register value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RegisterValue {
    U16(u16),
    I32(i32),
    F32(f32),
}

impl RegisterValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            RegisterValue::U16(_) => ValueKind::U16,
            RegisterValue::I32(_) => ValueKind::I32,
            RegisterValue::F32(_) => ValueKind::F32,
        }
    }

    /// Integer view of the value, `None` for floats.
    pub fn as_int(&self) -> Option<i32> {
        match *self {
            RegisterValue::U16(v) => Some(v as i32),
            RegisterValue::I32(v) => Some(v),
            RegisterValue::F32(_) => None,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match *self {
            RegisterValue::U16(v) => v as f64,
            RegisterValue::I32(v) => v as f64,
            RegisterValue::F32(v) => v as f64,
        }
    }

    /// Decodes `words` (device response order) as `kind`.
    ///
    /// Returns `None` when the block length does not match the encoding.
    pub fn decode(kind: ValueKind, words: &[u16], order: WordOrder) -> Option<Self> {
        match (kind, words) {
            (ValueKind::U16, &[word]) => Some(RegisterValue::U16(decode_u16(word))),
            (ValueKind::I32, &[w0, w1]) => Some(RegisterValue::I32(order.decode_int32([w0, w1]))),
            (ValueKind::F32, &[w0, w1]) => {
                Some(RegisterValue::F32(order.decode_float32([w0, w1])))
            }
            _ => None,
        }
    }

    pub fn encode(&self, order: WordOrder) -> Vec<u16> {
        match *self {
            RegisterValue::U16(v) => vec![v],
            RegisterValue::I32(v) => order.encode_int32(v).to_vec(),
            RegisterValue::F32(v) => order.encode_float32(v).to_vec(),
        }
    }
}

impl fmt::Display for RegisterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterValue::U16(v) => write!(f, "{v}"),
            RegisterValue::I32(v) => write!(f, "{v}"),
            RegisterValue::F32(v) => write!(f, "{v}"),
        }
    }
}
