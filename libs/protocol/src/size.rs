//! Memory and disk sizes.
//!
//! The control plane sends sizes either as a bare JSON number (gigabytes) or
//! as a string with an optional unit suffix. Both forms are parsed into a
//! [`Size`] held in whole MiB; anything else is rejected.

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use crate::error::SizeError;

const MIB_PER_GIB: u64 = 1024;

/// Largest accepted size (1 PiB).
const MAX_MIB: u64 = 1024 * 1024 * 1024;

/// A validated, positive size with MiB granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Size {
    mib: u64,
}

impl Size {
    /// Creates a size from MiB. Returns `None` for zero or out-of-range values.
    pub fn from_mib(mib: u64) -> Option<Self> {
        (mib > 0 && mib <= MAX_MIB).then_some(Self { mib })
    }

    /// Creates a size from GiB. Returns `None` for zero or out-of-range values.
    pub fn from_gib(gib: u64) -> Option<Self> {
        gib.checked_mul(MIB_PER_GIB).and_then(Self::from_mib)
    }

    /// Size in MiB.
    pub const fn as_mib(&self) -> u64 {
        self.mib
    }

    /// Size in whole GiB, rounded down.
    pub const fn whole_gib(&self) -> u64 {
        self.mib / MIB_PER_GIB
    }

    /// Parses a textual size such as `"20"`, `"20G"`, `"512MiB"` or `"1.5 TB"`.
    ///
    /// A bare number is read as GiB. Units are case-insensitive; decimal and
    /// binary spellings are treated alike.
    pub fn parse(input: &str) -> Result<Self, SizeError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(SizeError::Empty);
        }
        if trimmed.starts_with('-') {
            return Err(SizeError::NotPositive(trimmed.to_string()));
        }

        let split = trimmed
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(trimmed.len());
        let (number, unit) = trimmed.split_at(split);
        let unit = unit.trim();

        let value: f64 = number
            .parse()
            .map_err(|_| SizeError::InvalidNumber(trimmed.to_string()))?;
        let factor = unit_factor(unit).ok_or_else(|| SizeError::UnknownUnit(unit.to_string()))?;

        Self::from_scaled(value, factor, trimmed)
    }

    /// Parses a size from a JSON payload value.
    pub fn from_json(value: &Value) -> Result<Self, SizeError> {
        match value {
            Value::Number(number) => {
                let raw = number.to_string();
                let value = number
                    .as_f64()
                    .ok_or_else(|| SizeError::InvalidNumber(raw.clone()))?;
                Self::from_scaled(value, MIB_PER_GIB as f64, &raw)
            }
            Value::String(text) => Self::parse(text),
            Value::Null => Err(SizeError::InvalidType("null")),
            Value::Bool(_) => Err(SizeError::InvalidType("a boolean")),
            Value::Array(_) => Err(SizeError::InvalidType("an array")),
            Value::Object(_) => Err(SizeError::InvalidType("an object")),
        }
    }

    fn from_scaled(value: f64, mib_per_unit: f64, original: &str) -> Result<Self, SizeError> {
        if !value.is_finite() {
            return Err(SizeError::InvalidNumber(original.to_string()));
        }
        if value <= 0.0 {
            return Err(SizeError::NotPositive(original.to_string()));
        }

        let mib = (value * mib_per_unit).floor();
        if mib < 1.0 {
            return Err(SizeError::TooSmall(original.to_string()));
        }
        if mib > MAX_MIB as f64 {
            return Err(SizeError::TooLarge(original.to_string()));
        }

        Ok(Self { mib: mib as u64 })
    }
}

fn unit_factor(unit: &str) -> Option<f64> {
    match unit.to_ascii_lowercase().as_str() {
        "" | "g" | "gb" | "gib" => Some(MIB_PER_GIB as f64),
        "k" | "kb" | "kib" => Some(1.0 / 1024.0),
        "m" | "mb" | "mib" => Some(1.0),
        "t" | "tb" | "tib" => Some((MIB_PER_GIB * 1024) as f64),
        _ => None,
    }
}

/// Renders in the hypervisor's argument format: `8G`, or `1536M` when the
/// size is not a whole number of GiB.
impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.mib % MIB_PER_GIB == 0 {
            write!(f, "{}G", self.mib / MIB_PER_GIB)
        } else {
            write!(f, "{}M", self.mib)
        }
    }
}

impl FromStr for Size {
    type Err = SizeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
