//! Authoritative name to value mapping owned by the parameter server.
use itertools::Itertools;

use crate::types::{ParamValue, Params};
use crate::SyncError;

/// Process-wide parameter storage.
///
/// Values are never created implicitly: `set` and `add` only touch existing entries, and a request
/// naming an unknown parameter changes nothing.
#[derive(Debug, Default, Clone)]
pub struct ParameterStore {
    values: Params,
}

impl ParameterStore {
    pub fn new(values: Params) -> Self {
        Self { values }
    }

    /// Names of all parameters in the store.
    pub fn keys(&self) -> Vec<String> {
        self.values.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Copies of the requested entries.
    pub fn get<S: AsRef<str>>(&self, names: &[S]) -> Result<Params, SyncError> {
        names
            .iter()
            .map(|name| {
                let name = name.as_ref();
                self.values
                    .get(name)
                    .map(|value| (name.to_string(), value.clone()))
                    .ok_or_else(|| SyncError::UnknownKey(name.to_string()))
            })
            .collect()
    }

    /// Copy of every entry.
    pub fn snapshot(&self) -> Params {
        self.values.clone()
    }

    fn ensure_known(&self, params: &Params) -> Result<(), SyncError> {
        let unknown = params
            .keys()
            .filter(|name| !self.values.contains_key(*name))
            .join(", ");
        if unknown.is_empty() {
            Ok(())
        } else {
            Err(SyncError::UnknownKey(unknown))
        }
    }

    /// Overwrite existing entries.
    pub fn set(&mut self, params: Params) -> Result<(), SyncError> {
        self.ensure_known(&params)?;
        for (name, new) in params.iter() {
            self.values[name].check_assign(name, new)?;
        }
        for (name, new) in params {
            if let Some(value) = self.values.get_mut(&name) {
                value.assign(&name, new)?;
            }
        }
        Ok(())
    }

    /// `store[name] += delta` for every entry.
    pub fn add(&mut self, params: Params) -> Result<(), SyncError> {
        self.ensure_known(&params)?;
        for (name, delta) in params.iter() {
            self.values[name].check_add(name, delta)?;
        }
        for (name, delta) in params.iter() {
            if let Some(value) = self.values.get_mut(name) {
                value.add_assign(name, delta)?;
            }
        }
        Ok(())
    }

    /// Insert a new parameter or replace an existing one entirely.
    ///
    /// Only used when seeding the store; requests from clients go through `set` and `add`.
    pub fn insert(&mut self, name: impl Into<String>, value: ParamValue) {
        self.values.insert(name.into(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    fn store() -> ParameterStore {
        ParameterStore::new(Params::from([
            ("steps".to_string(), ParamValue::Scalar(1.0)),
            (
                "w".to_string(),
                ParamValue::Array(arr1(&[1.0f32, 1.0]).into_dyn()),
            ),
        ]))
    }

    #[test]
    fn get_unknown_key() {
        let store = store();
        assert_eq!(
            store.get(&["steps", "nope"]),
            Err(SyncError::UnknownKey("nope".to_string()))
        );
        assert_eq!(store.get(&["steps"]).unwrap().len(), 1);
    }

    #[test]
    fn failed_add_changes_nothing() {
        let mut store = store();
        let before = store.snapshot();
        let result = store.add(Params::from([
            ("steps".to_string(), ParamValue::Scalar(1.0)),
            (
                "w".to_string(),
                ParamValue::Array(arr1(&[1.0f32, 2.0, 3.0]).into_dyn()),
            ),
        ]));
        assert!(matches!(result, Err(SyncError::ShapeMismatch { .. })));
        assert_eq!(store.snapshot(), before);

        let result = store.add(Params::from([
            ("steps".to_string(), ParamValue::Scalar(1.0)),
            ("ghost".to_string(), ParamValue::Scalar(1.0)),
        ]));
        assert_eq!(result, Err(SyncError::UnknownKey("ghost".to_string())));
        assert_eq!(store.snapshot(), before);
    }

    #[test]
    fn failed_set_changes_nothing() {
        let mut store = store();
        let before = store.snapshot();
        let result = store.set(Params::from([
            ("steps".to_string(), ParamValue::Scalar(5.0)),
            ("w".to_string(), ParamValue::Scalar(0.0)),
        ]));
        assert!(matches!(result, Err(SyncError::TypeMismatch { .. })));
        assert_eq!(store.snapshot(), before);
    }

    #[test]
    fn set_then_add() {
        let mut store = store();
        store
            .set(Params::from([("steps".to_string(), ParamValue::Scalar(10.0))]))
            .unwrap();
        store
            .add(Params::from([("steps".to_string(), ParamValue::Scalar(2.0))]))
            .unwrap();
        assert_eq!(store.get(&["steps"]).unwrap()["steps"], ParamValue::Scalar(12.0));
        assert_eq!(store.keys(), vec!["steps".to_string(), "w".to_string()]);
    }
}
