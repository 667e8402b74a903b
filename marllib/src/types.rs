//! Parameter values and device descriptors.
use std::collections::BTreeMap;
use std::str::FromStr;

use ndarray::ArrayD;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::SyncError;


/// Data type for array elements.
pub type Elem = f32;
/// Data type for numeric arrays of any shape.
pub type Array = ArrayD<Elem>;
/// Mapping from parameter name to value, as sent over the wire.
pub type Params = BTreeMap<String, ParamValue>;

/// A single parameter value, as stored by the server and exchanged with clients.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum ParamValue {
    /// Scalar counter or statistic.
    Scalar(f64),
    /// Numeric array with a fixed shape.
    Array(Array),
    /// Fixed-length ordered list of arrays, e.g. per-layer weights.
    Sequence(Vec<Array>),
    /// Name to value mapping, e.g. per-agent statistics.
    Mapping(BTreeMap<String, ParamValue>),
    /// Opaque blob. Can be stored and fetched, but never merged or added.
    Bytes(Vec<u8>),
}

impl ParamValue {
    /// Short name of the value kind, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            ParamValue::Scalar(_) => "scalar",
            ParamValue::Array(_) => "array",
            ParamValue::Sequence(_) => "sequence",
            ParamValue::Mapping(_) => "mapping",
            ParamValue::Bytes(_) => "bytes",
        }
    }

    fn type_mismatch(key: &str, expected: &ParamValue, found: &ParamValue) -> SyncError {
        SyncError::TypeMismatch {
            key: key.to_string(),
            expected: expected.kind().to_string(),
            found: found.kind().to_string(),
        }
    }

    /// Check whether `delta` can be added to this value without modifying anything.
    pub fn check_add(&self, key: &str, delta: &ParamValue) -> Result<(), SyncError> {
        match (self, delta) {
            (ParamValue::Scalar(_), ParamValue::Scalar(_)) => Ok(()),
            (ParamValue::Array(_), ParamValue::Scalar(_)) => Ok(()),
            (ParamValue::Array(target), ParamValue::Array(delta)) => {
                check_broadcast(key, target, delta)
            }
            (ParamValue::Sequence(target), ParamValue::Sequence(delta)) => {
                if target.len() != delta.len() {
                    return Err(SyncError::ShapeMismatch {
                        key: key.to_string(),
                        expected: vec![target.len()],
                        found: vec![delta.len()],
                    });
                }
                target
                    .iter()
                    .zip(delta)
                    .try_for_each(|(t, d)| check_broadcast(key, t, d))
            }
            (ParamValue::Mapping(target), ParamValue::Mapping(delta)) => {
                for (name, d) in delta {
                    let path = format!("{key}/{name}");
                    match target.get(name) {
                        Some(t) => t.check_add(&path, d)?,
                        None => return Err(SyncError::UnknownKey(path)),
                    }
                }
                Ok(())
            }
            (ParamValue::Bytes(_), _) => Err(SyncError::UnsupportedType {
                key: key.to_string(),
                kind: self.kind().to_string(),
            }),
            (target, delta) => Err(Self::type_mismatch(key, target, delta)),
        }
    }

    /// Numeric addition: `self += delta`.
    ///
    /// Scalar deltas are broadcast over arrays. Nothing is modified if the delta is incompatible.
    pub fn add_assign(&mut self, key: &str, delta: &ParamValue) -> Result<(), SyncError> {
        self.check_add(key, delta)?;
        self.add_unchecked(delta);
        Ok(())
    }

    fn add_unchecked(&mut self, delta: &ParamValue) {
        match (self, delta) {
            (ParamValue::Scalar(target), ParamValue::Scalar(delta)) => *target += delta,
            (ParamValue::Array(target), ParamValue::Scalar(delta)) => {
                *target += *delta as Elem;
            }
            (ParamValue::Array(target), ParamValue::Array(delta)) => *target += delta,
            (ParamValue::Sequence(target), ParamValue::Sequence(delta)) => {
                for (t, d) in target.iter_mut().zip(delta) {
                    *t += d;
                }
            }
            (ParamValue::Mapping(target), ParamValue::Mapping(delta)) => {
                for (name, d) in delta {
                    if let Some(t) = target.get_mut(name) {
                        t.add_unchecked(d);
                    }
                }
            }
            _ => unreachable!("add_unchecked called without check_add"),
        }
    }

    /// Check whether `new` can overwrite this value.
    pub fn check_assign(&self, key: &str, new: &ParamValue) -> Result<(), SyncError> {
        match (self, new) {
            (ParamValue::Scalar(_), ParamValue::Scalar(_))
            | (ParamValue::Array(_), ParamValue::Array(_))
            | (ParamValue::Sequence(_), ParamValue::Sequence(_))
            | (ParamValue::Bytes(_), ParamValue::Bytes(_)) => Ok(()),
            (ParamValue::Mapping(target), ParamValue::Mapping(new)) => {
                for (name, n) in new {
                    if let Some(t) = target.get(name) {
                        t.check_assign(&format!("{key}/{name}"), n)?;
                    }
                }
                Ok(())
            }
            (target, new) => Err(Self::type_mismatch(key, target, new)),
        }
    }

    /// Overwrite this value with `new`.
    ///
    /// Arrays with an unchanged shape are written in place. Mappings are overwritten key-wise.
    pub fn assign(&mut self, key: &str, new: ParamValue) -> Result<(), SyncError> {
        self.check_assign(key, &new)?;
        self.assign_unchecked(new);
        Ok(())
    }

    fn assign_unchecked(&mut self, new: ParamValue) {
        match (self, new) {
            (ParamValue::Array(target), ParamValue::Array(new)) if target.shape() == new.shape() => {
                target.assign(&new);
            }
            (ParamValue::Mapping(target), ParamValue::Mapping(new)) => {
                for (name, n) in new {
                    match target.get_mut(&name) {
                        Some(t) => t.assign_unchecked(n),
                        None => {
                            target.insert(name, n);
                        }
                    }
                }
            }
            (target, new) => *target = new,
        }
    }

    /// Sum `delta` into an accumulation buffer key-wise, inserting keys that are not buffered yet.
    ///
    /// Every key is checked before the buffer is touched, so a rejected delta leaves it as it
    /// was. A buffered scalar is promoted when an array delta for the same key arrives.
    pub fn accumulate(buffer: &mut Params, delta: Params) -> Result<(), SyncError> {
        for (name, d) in &delta {
            if let Some(b) = buffer.get(name) {
                b.check_accumulate(name, d)?;
            }
        }
        for (name, d) in delta {
            match buffer.get_mut(&name) {
                Some(b) => b.accumulate_unchecked(d),
                None => {
                    buffer.insert(name, d);
                }
            }
        }
        Ok(())
    }

    fn check_accumulate(&self, key: &str, delta: &ParamValue) -> Result<(), SyncError> {
        match (self, delta) {
            (ParamValue::Scalar(_), ParamValue::Array(_)) => Ok(()),
            (ParamValue::Array(buffered), ParamValue::Array(delta))
                if buffered.broadcast(delta.raw_dim()).is_some() =>
            {
                Ok(())
            }
            (ParamValue::Mapping(buffered), ParamValue::Mapping(delta)) => {
                for (name, d) in delta {
                    if let Some(b) = buffered.get(name) {
                        b.check_accumulate(&format!("{key}/{name}"), d)?;
                    }
                }
                Ok(())
            }
            (buffered, delta) => buffered.check_add(key, delta),
        }
    }

    fn accumulate_unchecked(&mut self, delta: ParamValue) {
        match (self, delta) {
            (ParamValue::Mapping(buffered), ParamValue::Mapping(delta)) => {
                for (name, d) in delta {
                    match buffered.get_mut(&name) {
                        Some(b) => b.accumulate_unchecked(d),
                        None => {
                            buffered.insert(name, d);
                        }
                    }
                }
            }
            (buffered, ParamValue::Array(mut d)) if matches!(buffered, ParamValue::Scalar(_)) => {
                if let ParamValue::Scalar(s) = &*buffered {
                    d += *s as Elem;
                }
                *buffered = ParamValue::Array(d);
            }
            (ParamValue::Array(buffered), ParamValue::Array(mut d))
                if d.broadcast(buffered.raw_dim()).is_none() =>
            {
                // The buffered delta is the smaller one; widen it to the new shape.
                d += &*buffered;
                *buffered = d;
            }
            (buffered, d) => buffered.add_unchecked(&d),
        }
    }
}

fn check_broadcast(key: &str, target: &Array, delta: &Array) -> Result<(), SyncError> {
    if delta.broadcast(target.raw_dim()).is_some() {
        Ok(())
    } else {
        Err(SyncError::ShapeMismatch {
            key: key.to_string(),
            expected: target.shape().to_vec(),
            found: delta.shape().to_vec(),
        })
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Scalar(value)
    }
}

impl From<Array> for ParamValue {
    fn from(value: Array) -> Self {
        ParamValue::Array(value)
    }
}

impl From<Vec<Array>> for ParamValue {
    fn from(value: Vec<Array>) -> Self {
        ParamValue::Sequence(value)
    }
}

/// Compute device on which replica arrays are materialized.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum Device {
    #[default]
    Cpu,
    /// Accelerator with the given ordinal.
    Cuda(usize),
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(i) => write!(f, "cuda:{}", i),
        }
    }
}

impl FromStr for Device {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        match lower.split_once(':') {
            None if lower == "cpu" => Ok(Device::Cpu),
            None if lower == "cuda" || lower == "gpu" => Ok(Device::Cuda(0)),
            Some(("cuda" | "gpu", ordinal)) => ordinal
                .parse()
                .map(Device::Cuda)
                .map_err(|_| SyncError::Config(format!("Invalid device ordinal in '{s}'"))),
            _ => Err(SyncError::Config(format!("Unknown device '{s}'"))),
        }
    }
}

// Devices are written as plain strings in configuration files.
impl Serialize for Device {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Device {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Where the replica copy of a parameter lives.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum Placement {
    /// The whole parameter lives on one device.
    Single(Device),
    /// One device per element of a [`ParamValue::Sequence`].
    PerElement(Vec<Device>),
}

impl Placement {
    /// Device for the element at `index`, falling back to `default` if not listed.
    pub fn device(&self, index: usize, default: Device) -> Device {
        match self {
            Placement::Single(device) => *device,
            Placement::PerElement(devices) => devices.get(index).copied().unwrap_or(default),
        }
    }
}
