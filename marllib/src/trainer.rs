//! Trainer hooks that publish new weights and step counters.
use crate::client::ParameterClient;
use crate::types::Params;
use crate::SyncError;

#[cfg(test)]
mod tests;

/// State shared by the trainer components.
#[derive(Debug, Default)]
pub struct TrainerStore {
    pub parameter_client: Option<ParameterClient>,
    /// Weights produced by the last optimizer step, by parameter name.
    pub weights: Params,
    /// Number of completed training steps.
    pub steps: usize,
}

impl TrainerStore {
    pub fn with_parameter_client(mut self, client: ParameterClient) -> Self {
        self.parameter_client = Some(client);
        self
    }
}

/// Trainer component hooks. Every hook does nothing by default.
pub trait TrainerHooks {
    fn on_training_init(&mut self, _store: &mut TrainerStore) -> Result<(), SyncError> {
        Ok(())
    }

    fn on_training_step_start(&mut self, _store: &mut TrainerStore) -> Result<(), SyncError> {
        Ok(())
    }

    fn on_training_step_end(&mut self, _store: &mut TrainerStore) -> Result<(), SyncError> {
        Ok(())
    }
}

/// Publishes the trainer's weights and counters after every step.
#[derive(Debug, Clone, Default)]
pub struct TrainerParameterSync {
    /// Deltas added to the server after every step, e.g. `trainer_steps: 1`.
    pub step_counters: Params,
}

impl TrainerParameterSync {
    pub fn new(step_counters: Params) -> Self {
        Self { step_counters }
    }
}

impl TrainerHooks for TrainerParameterSync {
    /// Start from the server's current values.
    fn on_training_init(&mut self, store: &mut TrainerStore) -> Result<(), SyncError> {
        match store.parameter_client.as_mut() {
            Some(client) => client.get_all_and_wait(),
            None => Ok(()),
        }
    }

    fn on_training_step_end(&mut self, store: &mut TrainerStore) -> Result<(), SyncError> {
        let Some(client) = store.parameter_client.as_mut() else {
            return Ok(());
        };
        let weights = if store.weights.is_empty() {
            None
        } else {
            Some(store.weights.clone())
        };
        client.set_async(weights)?;
        if !self.step_counters.is_empty() {
            client.add_async(self.step_counters.clone())?;
        }
        Ok(())
    }
}

/// A trainer made of components that react to its hooks, in order.
pub struct Trainer {
    pub store: TrainerStore,
    components: Vec<Box<dyn TrainerHooks + Send>>,
}

impl Trainer {
    /// Create the trainer and run the init hooks.
    pub fn new(
        store: TrainerStore,
        components: Vec<Box<dyn TrainerHooks + Send>>,
    ) -> Result<Self, SyncError> {
        let mut trainer = Self { store, components };
        for component in trainer.components.iter_mut() {
            component.on_training_init(&mut trainer.store)?;
        }
        Ok(trainer)
    }

    /// Run one training step. `update` computes the new weights into the store.
    pub fn step<F>(&mut self, update: F) -> Result<(), SyncError>
    where
        F: FnOnce(&mut TrainerStore) -> Result<(), SyncError>,
    {
        for component in self.components.iter_mut() {
            component.on_training_step_start(&mut self.store)?;
        }
        update(&mut self.store)?;
        self.store.steps += 1;
        for component in self.components.iter_mut() {
            component.on_training_step_end(&mut self.store)?;
        }
        Ok(())
    }

    /// Wait until every counter increment has reached the server.
    pub fn finish(&self) -> Result<(), SyncError> {
        match self.store.parameter_client.as_ref() {
            Some(client) => client.wait_for_adds(),
            None => Ok(()),
        }
    }
}
