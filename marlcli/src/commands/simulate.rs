/// Simulated training run: executors and trainers exchanging parameters through one node.
use std::collections::BTreeMap;
use std::thread;
use std::time::Instant;

use marllib::client::ParameterClient;
use marllib::config::{read_yaml_file, ClientConfig, SimulationConfig};
use marllib::node::{ServerNode, Transport};
use marllib::observing::{
    Adder, AdderAction, Executor, ExecutorObserve, ExecutorStore, Extras, StepType, TimeStep,
};
use marllib::server::ParameterServer;
use marllib::trainer::{Trainer, TrainerParameterSync, TrainerStore};
use marllib::types::{Array, ParamValue, Params};
use marllib::{create_rng, SyncError, RANDOM_SEED};
use rand::Rng;

use super::*;

/// Counts the transitions an executor produces.
#[derive(Debug, Default)]
struct CountingAdder {
    episodes: usize,
    transitions: usize,
}

impl Adder for CountingAdder {
    fn add_first(&mut self, _timestep: &TimeStep, extras: &Extras) -> Result<(), SyncError> {
        self.episodes += 1;
        log::debug!("Episode {} with networks {:?}", self.episodes, extras.network_int_keys);
        Ok(())
    }

    fn add(
        &mut self,
        _actions: &BTreeMap<String, AdderAction>,
        _next_timestep: &TimeStep,
        _next_extras: &Extras,
    ) -> Result<(), SyncError> {
        self.transitions += 1;
        Ok(())
    }
}

/// What a worker thread did before it stopped.
#[derive(Debug, Default, Clone, Copy)]
struct WorkerReport {
    steps: usize,
    episodes: usize,
}

fn seed_thread(config: &SimulationConfig, offset: u64) {
    if let Some(seed) = config.seed {
        RANDOM_SEED.with_borrow_mut(|s| *s = Some(seed.wrapping_add(offset)));
    }
}

fn counter(name: &str) -> Params {
    BTreeMap::from([(name.to_string(), ParamValue::Scalar(1.0))])
}

fn timestep(config: &SimulationConfig, step_type: StepType, t: usize) -> TimeStep {
    TimeStep {
        step_type,
        observations: config
            .agents
            .iter()
            .map(|agent| (agent.clone(), Array::from_elem(vec![2], t as f32)))
            .collect(),
        rewards: config.agents.iter().map(|agent| (agent.clone(), 1.0)).collect(),
        discounts: config.agents.iter().map(|agent| (agent.clone(), 1.0)).collect(),
    }
}

fn run_executor(
    config: &SimulationConfig,
    transport: Transport,
    id: usize,
) -> Result<WorkerReport, SyncError> {
    seed_thread(config, id as u64);
    let mut get_keys = config.network_keys();
    get_keys.push("trainer_steps".to_string());
    let client = ParameterClient::new(
        ClientConfig {
            get_keys,
            update_period: config.update_period,
            multi_process: true,
            ..Default::default()
        },
        config.initial_parameters(),
        transport,
    )?;
    let store = ExecutorStore::new(
        &config.agents,
        config.network_sampling_setup.clone(),
        config.net_keys_to_ids(),
    )?
    .with_adder(Box::new(CountingAdder::default()))
    .with_parameter_client(client);
    let mut executor = Executor::new(store, vec![Box::new(ExecutorObserve)]);
    let mut rng = create_rng();

    let mut report = WorkerReport::default();
    let episode_length = config.episode_length.max(1);
    executor.update(true)?;
    while report.steps < config.steps && !interrupted() {
        let t = report.steps % episode_length;
        if t == 0 {
            executor.observe_first(timestep(config, StepType::First, 0), Extras::default())?;
            report.episodes += 1;
        }
        let actions = config
            .agents
            .iter()
            .map(|agent| (agent.clone(), ParamValue::Scalar(rng.gen_range(0..4) as f64)))
            .collect();
        let step_type = if t + 1 == episode_length {
            StepType::Last
        } else {
            StepType::Mid
        };
        executor.observe(actions, timestep(config, step_type, t + 1), Extras::default())?;
        executor.update(false)?;
        if let Some(client) = executor.store.parameter_client.as_mut() {
            client.add_async(counter("executor_steps"))?;
        }
        report.steps += 1;
    }
    if let Some(client) = executor.store.parameter_client.as_ref() {
        client.wait_for_adds()?;
        log::debug!(
            "Executor {id} finished, trainer steps seen: {:?}",
            client.value("trainer_steps")
        );
    }
    Ok(report)
}

fn run_trainer(
    config: &SimulationConfig,
    transport: Transport,
    id: usize,
) -> Result<WorkerReport, SyncError> {
    seed_thread(config, 1000 + id as u64);
    let network_keys = config.network_keys();
    let client = ParameterClient::new(
        ClientConfig {
            set_keys: network_keys.clone(),
            update_period: config.update_period,
            multi_process: true,
            ..Default::default()
        },
        config.initial_parameters(),
        transport,
    )?;
    let mut trainer = Trainer::new(
        TrainerStore::default().with_parameter_client(client),
        vec![Box::new(TrainerParameterSync::new(counter("trainer_steps")))],
    )?;
    let mut rng = create_rng();

    while trainer.store.steps < config.steps && !interrupted() {
        trainer.step(|store| {
            store.weights = network_keys
                .iter()
                .map(|key| {
                    let weights = Array::from_shape_simple_fn(config.policy_shape.clone(), || {
                        rng.gen_range(-1.0..1.0)
                    });
                    (key.clone(), ParamValue::Array(weights))
                })
                .collect();
            Ok(())
        })?;
    }
    trainer.finish()?;
    Ok(WorkerReport {
        steps: trainer.store.steps,
        episodes: 0,
    })
}

fn join_all(
    role: &str,
    handles: Vec<thread::JoinHandle<Result<WorkerReport, SyncError>>>,
) -> Vec<WorkerReport> {
    handles
        .into_iter()
        .enumerate()
        .map(|(i, handle)| match handle.join() {
            Ok(Ok(report)) => report,
            Ok(Err(e)) => fatal_error!(1, "{role} {i} failed: {e}"),
            Err(_) => fatal_error!(1, "{role} {i} panicked"),
        })
        .collect()
}

impl Simulate {
    pub fn run(self) {
        let Simulate { path } = self;
        let config: SimulationConfig = match read_yaml_file(&path) {
            Ok(config) => config,
            Err(e) => fatal_error!(1, "Cannot read simulation config: {}", e),
        };
        println!(
            "{:14}{} executors, {} trainers, {} steps",
            "Simulation:".bold(),
            config.executors,
            config.trainers,
            config.steps
        );
        println!("{:14}{}", "Networks:".bold(), config.network_keys().join(", "));

        let node = match ServerNode::start(
            ParameterServer::new(config.initial_parameters()),
            &config.node,
        ) {
            Ok(node) => node,
            Err(e) => fatal_error!(1, "Cannot start the parameter server: {}", e),
        };

        let start = Instant::now();
        RUNNING_STATE.store(2, atomic::Ordering::SeqCst);
        let trainers: Vec<_> = (0..config.trainers)
            .map(|i| {
                let config = config.clone();
                let transport = node.transport();
                thread::spawn(move || run_trainer(&config, transport, i))
            })
            .collect();
        let executors: Vec<_> = (0..config.executors)
            .map(|i| {
                let config = config.clone();
                let transport = node.transport();
                thread::spawn(move || run_executor(&config, transport, i))
            })
            .collect();

        let trainer_reports = join_all("Trainer", trainers);
        let executor_reports = join_all("Executor", executors);
        RUNNING_STATE.store(0, atomic::Ordering::SeqCst);

        let snapshot = node.server().snapshot();
        let stats = node.server().stats();
        node.shutdown();

        let trainer_steps: usize = trainer_reports.iter().map(|r| r.steps).sum();
        let executor_steps: usize = executor_reports.iter().map(|r| r.steps).sum();
        let episodes: usize = executor_reports.iter().map(|r| r.episodes).sum();

        println!(
            "\n{} in {:.2} seconds",
            "Simulation finished".green().bold(),
            start.elapsed().as_secs_f64()
        );
        println!("    {:18}{}", "Episodes:".bold(), episodes);
        println!(
            "    {:18}gets: {} | sets: {} | adds: {}",
            "Requests served:".bold(),
            stats.gets,
            stats.sets,
            stats.adds
        );

        let mut mismatch = false;
        for (name, expected) in [
            ("trainer_steps", trainer_steps),
            ("executor_steps", executor_steps),
        ] {
            let found = snapshot.get(name);
            let ok = found == Some(&ParamValue::Scalar(expected as f64));
            println!(
                "    {:18}{} (expected {})",
                format!("{name}:").bold(),
                match found {
                    Some(ParamValue::Scalar(v)) => format!("{v}"),
                    _ => "-".to_string(),
                },
                expected
            );
            mismatch |= !ok;
        }
        if mismatch {
            fatal_error!(2, "Step counters don't match the number of steps taken");
        }
        println!("{}", "Counters verified.".green());
    }
}
