//! Local replica of a subset of the server parameters, and how server responses are merged into
//! it.
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use ndarray::Axis;

use crate::types::{Array, Device, ParamValue, Params, Placement};
use crate::SyncError;

/// Array shared between the replica and whoever reads it.
///
/// Merges write into the same allocation, so holders of a handle see new values without
/// re-fetching the handle.
pub type SharedArray = Arc<RwLock<Array>>;
/// Scalar shared between the replica and whoever reads it.
pub type SharedScalar = Arc<RwLock<f64>>;

fn read<T: Clone>(lock: &RwLock<T>) -> T {
    lock.read().unwrap_or_else(PoisonError::into_inner).clone()
}

/// A replica slot. The variant is fixed when the replica is built and decides how responses for
/// this parameter are merged.
#[derive(Debug, Clone)]
pub enum Param {
    /// Scalar overwritten in place.
    Counter(SharedScalar),
    /// Array zeroed and refilled in place.
    Array(SharedArray),
    /// Per-layer arrays, each updated in place by index.
    Sequence(Vec<SharedArray>),
    /// One-level mapping, overwritten element-wise.
    Mapping(BTreeMap<String, ParamValue>),
    /// Two-level mapping (e.g. agent -> statistic -> value), updated element-wise.
    NestedStats(BTreeMap<String, BTreeMap<String, ParamValue>>),
    /// A value kind that cannot be merged. Merging into it is a configuration error.
    Unsupported(ParamValue),
}

impl Param {
    /// Build the slot for an initial value.
    pub fn from_value(value: ParamValue) -> Self {
        match value {
            ParamValue::Scalar(v) => Param::Counter(Arc::new(RwLock::new(v))),
            ParamValue::Array(a) => Param::Array(Arc::new(RwLock::new(a))),
            ParamValue::Sequence(seq) => Param::Sequence(
                seq.into_iter()
                    .map(|a| Arc::new(RwLock::new(a)))
                    .collect(),
            ),
            ParamValue::Mapping(map)
                if !map.is_empty()
                    && map.values().all(|v| matches!(v, ParamValue::Mapping(_))) =>
            {
                Param::NestedStats(
                    map.into_iter()
                        .filter_map(|(k, v)| match v {
                            ParamValue::Mapping(inner) => Some((k, inner)),
                            _ => None,
                        })
                        .collect(),
                )
            }
            ParamValue::Mapping(map) => Param::Mapping(map),
            other => Param::Unsupported(other),
        }
    }

    /// Detached copy of the current value.
    pub fn to_value(&self) -> ParamValue {
        match self {
            Param::Counter(v) => ParamValue::Scalar(read(v)),
            Param::Array(a) => ParamValue::Array(read(a)),
            Param::Sequence(seq) => ParamValue::Sequence(seq.iter().map(|a| read(a)).collect()),
            Param::Mapping(map) => ParamValue::Mapping(map.clone()),
            Param::NestedStats(map) => ParamValue::Mapping(
                map.iter()
                    .map(|(k, inner)| (k.clone(), ParamValue::Mapping(inner.clone())))
                    .collect(),
            ),
            Param::Unsupported(value) => value.clone(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Param::Counter(_) => "scalar",
            Param::Array(_) => "array",
            Param::Sequence(_) => "sequence",
            Param::Mapping(_) => "mapping",
            Param::NestedStats(_) => "nested mapping",
            Param::Unsupported(value) => value.kind(),
        }
    }
}

/// Materializes arrays on a compute device.
pub trait DevicePlacer: Send + Sync {
    fn device_put(&self, value: Array, device: Device) -> Result<Array, SyncError>;
}

/// Placer for hosts without accelerators: CPU placement is a no-op and anything else fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostPlacer;

impl DevicePlacer for HostPlacer {
    fn device_put(&self, value: Array, device: Device) -> Result<Array, SyncError> {
        match device {
            Device::Cpu => Ok(value),
            other => Err(SyncError::Device(format!(
                "no accelerator backend available for {other}"
            ))),
        }
    }
}

/// Routes replica copies through a [`DevicePlacer`] according to a per-parameter placement map.
pub struct DeviceMap {
    placements: HashMap<String, Placement>,
    default_device: Device,
    placer: Box<dyn DevicePlacer>,
}

impl DeviceMap {
    pub fn new(
        placements: HashMap<String, Placement>,
        default_device: Device,
        placer: Box<dyn DevicePlacer>,
    ) -> Self {
        Self {
            placements,
            default_device,
            placer,
        }
    }

    fn device(&self, key: &str, index: usize) -> Device {
        self.placements
            .get(key)
            .map(|placement| placement.device(index, self.default_device))
            .unwrap_or(self.default_device)
    }

    fn put(&self, key: &str, index: usize, value: Array) -> Result<Array, SyncError> {
        self.placer.device_put(value, self.device(key, index))
    }
}

impl std::fmt::Debug for DeviceMap {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("DeviceMap")
            .field("placements", &self.placements)
            .field("default_device", &self.default_device)
            .finish()
    }
}

/// Local copies of the parameters a client tracks.
#[derive(Debug)]
pub struct Replica {
    params: BTreeMap<String, Param>,
    devices: Option<DeviceMap>,
    /// Apply only the first slice of a response that has one extra leading axis.
    slice_leading_axis: bool,
}

impl Replica {
    pub fn new(params: Params, devices: Option<DeviceMap>, slice_leading_axis: bool) -> Self {
        Self {
            params: params
                .into_iter()
                .map(|(k, v)| (k, Param::from_value(v)))
                .collect(),
            devices,
            slice_leading_axis,
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.params.keys()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.params.contains_key(key)
    }

    /// The slot for `key`; clones share storage with the replica.
    pub fn get(&self, key: &str) -> Option<&Param> {
        self.params.get(key)
    }

    /// Detached copies of the given parameters.
    pub fn values<S: AsRef<str>>(&self, keys: &[S]) -> Result<Params, SyncError> {
        keys.iter()
            .map(|key| {
                let key = key.as_ref();
                self.params
                    .get(key)
                    .map(|param| (key.to_string(), param.to_value()))
                    .ok_or_else(|| SyncError::UnknownKey(key.to_string()))
            })
            .collect()
    }

    /// Merge a server response into the replica.
    ///
    /// The whole response is checked, and placed on its devices, before any slot is written, so
    /// a failed merge leaves the replica unchanged.
    pub fn copy(&mut self, new_parameters: Params) -> Result<(), SyncError> {
        let staged = new_parameters
            .into_iter()
            .map(|(key, new)| {
                let param = self
                    .params
                    .get(&key)
                    .ok_or_else(|| SyncError::UnknownKey(key.clone()))?;
                let update = stage(
                    &key,
                    param,
                    new,
                    self.devices.as_ref(),
                    self.slice_leading_axis,
                )?;
                Ok((key, update))
            })
            .collect::<Result<Vec<_>, SyncError>>()?;
        for (key, update) in staged {
            if let Some(param) = self.params.get_mut(&key) {
                commit(param, update);
            }
        }
        Ok(())
    }
}

fn mismatch(key: &str, param: &Param, new: &ParamValue) -> SyncError {
    SyncError::TypeMismatch {
        key: key.to_string(),
        expected: param.kind().to_string(),
        found: new.kind().to_string(),
    }
}

/// How one array slot will be written.
enum ArrayUpdate {
    /// Zero the slot and add the value, keeping the allocation.
    InPlace(Array),
    /// Same, using only the first slice along the leading axis.
    FirstSlice(Array),
    /// Replace the slot contents, e.g. with an array placed on a device.
    Replace(Array),
}

/// A validated update for one replica slot.
enum Update {
    Counter(f64),
    Array(ArrayUpdate),
    Sequence(Vec<ArrayUpdate>),
    NestedStats(Vec<(String, String, ParamValue)>),
    Mapping(BTreeMap<String, ParamValue>),
}

fn stage(
    key: &str,
    param: &Param,
    new: ParamValue,
    devices: Option<&DeviceMap>,
    slice_leading_axis: bool,
) -> Result<Update, SyncError> {
    let update = match (param, new) {
        (Param::Counter(_), ParamValue::Scalar(value)) => Update::Counter(value),
        (Param::Array(slot), ParamValue::Array(value)) => Update::Array(match devices {
            Some(devices) => ArrayUpdate::Replace(devices.put(key, 0, value)?),
            None => {
                let local = slot.read().unwrap_or_else(PoisonError::into_inner);
                stage_in_place(key, &local, value, slice_leading_axis)?
            }
        }),
        (Param::Sequence(slots), ParamValue::Sequence(values)) => {
            if values.len() < slots.len() {
                return Err(SyncError::ShapeMismatch {
                    key: key.to_string(),
                    expected: vec![slots.len()],
                    found: vec![values.len()],
                });
            }
            let updates = slots
                .iter()
                .zip(values)
                .enumerate()
                .map(|(i, (slot, value))| match devices {
                    Some(devices) => Ok(ArrayUpdate::Replace(devices.put(key, i, value)?)),
                    None => {
                        let local = slot.read().unwrap_or_else(PoisonError::into_inner);
                        if local.shape() == value.shape() {
                            Ok(ArrayUpdate::InPlace(value))
                        } else {
                            Ok(ArrayUpdate::Replace(value))
                        }
                    }
                })
                .collect::<Result<Vec<_>, SyncError>>()?;
            Update::Sequence(updates)
        }
        (Param::NestedStats(local), ParamValue::Mapping(new)) => {
            if devices.is_some() {
                return Err(SyncError::NotImplemented(format!(
                    "device placement for nested mapping '{key}'"
                )));
            }
            let mut updates = Vec::new();
            for (outer, new_value) in new {
                let path = format!("{key}/{outer}");
                let found = new_value.kind();
                let ParamValue::Mapping(mut new_stats) = new_value else {
                    return Err(SyncError::TypeMismatch {
                        key: path,
                        expected: "mapping".to_string(),
                        found: found.to_string(),
                    });
                };
                let stats = local
                    .get(&outer)
                    .ok_or_else(|| SyncError::UnknownKey(path.clone()))?;
                for stat in stats.keys() {
                    match new_stats.remove(stat) {
                        Some(value) => updates.push((outer.clone(), stat.clone(), value)),
                        None => return Err(SyncError::UnknownKey(format!("{path}/{stat}"))),
                    }
                }
            }
            Update::NestedStats(updates)
        }
        (Param::Mapping(_), ParamValue::Mapping(new)) => Update::Mapping(new),
        (Param::Unsupported(value), _) => {
            return Err(SyncError::UnsupportedType {
                key: key.to_string(),
                kind: value.kind().to_string(),
            });
        }
        (param, new) => return Err(mismatch(key, param, &new)),
    };
    Ok(update)
}

fn write_array(local: &mut Array, update: ArrayUpdate) {
    match update {
        ArrayUpdate::InPlace(value) if value.shape() == local.shape() => {
            local.fill(0.0);
            *local += &value;
        }
        ArrayUpdate::FirstSlice(value) if &value.shape()[1..] == local.shape() => {
            local.fill(0.0);
            *local += &value.index_axis(Axis(0), 0);
        }
        ArrayUpdate::FirstSlice(value) => *local = value.index_axis(Axis(0), 0).to_owned(),
        ArrayUpdate::InPlace(value) | ArrayUpdate::Replace(value) => *local = value,
    }
}

/// Write a staged update. The update was built against this slot, so it always fits.
fn commit(param: &mut Param, update: Update) {
    match (param, update) {
        (Param::Counter(slot), Update::Counter(value)) => {
            *slot.write().unwrap_or_else(PoisonError::into_inner) = value;
        }
        (Param::Array(slot), Update::Array(update)) => {
            write_array(&mut slot.write().unwrap_or_else(PoisonError::into_inner), update);
        }
        (Param::Sequence(slots), Update::Sequence(updates)) => {
            for (slot, update) in slots.iter().zip(updates) {
                write_array(&mut slot.write().unwrap_or_else(PoisonError::into_inner), update);
            }
        }
        (Param::NestedStats(local), Update::NestedStats(updates)) => {
            for (outer, stat, value) in updates {
                if let Some(slot) = local.get_mut(&outer).and_then(|stats| stats.get_mut(&stat)) {
                    *slot = value;
                }
            }
        }
        (Param::Mapping(local), Update::Mapping(new)) => local.extend(new),
        _ => log::error!("Staged update does not match its replica slot"),
    }
}

/// Decide how a fetched array is written into a local one of possibly different shape.
fn stage_in_place(
    key: &str,
    local: &Array,
    new: Array,
    slice_leading_axis: bool,
) -> Result<ArrayUpdate, SyncError> {
    if new.shape() == local.shape() {
        return Ok(ArrayUpdate::InPlace(new));
    }
    let has_extra_axis = new.ndim() == local.ndim() + 1
        && new.shape()[0] > 0
        && &new.shape()[1..] == local.shape();
    if !(slice_leading_axis && has_extra_axis) {
        return Err(SyncError::ShapeMismatch {
            key: key.to_string(),
            expected: local.shape().to_vec(),
            found: new.shape().to_vec(),
        });
    }
    log::trace!("Applying the first slice of '{key}' with shape {:?}", new.shape());
    Ok(ArrayUpdate::FirstSlice(new))
}
