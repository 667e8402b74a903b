//! Agent ordering and per-episode network sampling.
use std::cmp::Ordering;
use std::collections::{BTreeMap, VecDeque};

use rand::Rng;

use crate::SyncError;

#[derive(PartialEq, Eq, PartialOrd, Ord, Debug)]
enum Chunk {
    Text(String),
    Number(u128),
}

fn natural_key(s: &str) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest.starts_with(|c: char| c.is_ascii_digit());
        let end = rest
            .find(|c: char| c.is_ascii_digit() != digits)
            .unwrap_or(rest.len());
        let (chunk, tail) = rest.split_at(end);
        chunks.push(if digits {
            Chunk::Number(chunk.parse().unwrap_or(u128::MAX))
        } else {
            Chunk::Text(chunk.to_lowercase())
        });
        rest = tail;
    }
    chunks
}

/// Compare two strings treating runs of digits as numbers, so `agent_2 < agent_10`.
pub fn str_num_cmp(a: &str, b: &str) -> Ordering {
    natural_key(a).cmp(&natural_key(b)).then_with(|| a.cmp(b))
}

/// Sort strings in alpha-numeric order.
pub fn sort_str_num<I: IntoIterator<Item = String>>(keys: I) -> Vec<String> {
    let mut keys: Vec<String> = keys.into_iter().collect();
    keys.sort_by(|a, b| str_num_cmp(a, b));
    keys
}

/// Integer network identifiers per agent, stored in the episode extras.
pub type NetworkIntKeys = BTreeMap<String, i64>;
/// Network key per agent.
pub type AgentNetKeys = BTreeMap<String, String>;

/// Assign networks to agents for a new episode.
///
/// Agents are taken in alpha-numeric order. Until every agent has a network, a uniformly random
/// entry of `sampling_setup` is drawn and its network keys are handed to the next agents in turn.
pub fn sample_new_agent_keys<R: Rng>(
    agents: &[String],
    sampling_setup: &[Vec<String>],
    net_keys_to_ids: &BTreeMap<String, i64>,
    rng: &mut R,
) -> Result<(NetworkIntKeys, AgentNetKeys), SyncError> {
    if sampling_setup.is_empty() || sampling_setup.iter().any(Vec::is_empty) {
        return Err(SyncError::Sampling(
            "network sampling setup must contain non-empty entries".to_string(),
        ));
    }

    let mut slots: VecDeque<String> = sort_str_num(agents.iter().cloned()).into();
    let mut agent_net_keys = AgentNetKeys::new();
    while !slots.is_empty() {
        let sample = &sampling_setup[rng.gen_range(0..sampling_setup.len())];
        for net_key in sample {
            let Some(agent) = slots.pop_front() else {
                break;
            };
            agent_net_keys.insert(agent, net_key.clone());
        }
    }

    let network_int_keys = agent_net_keys
        .iter()
        .map(|(agent, net_key)| {
            net_keys_to_ids
                .get(net_key)
                .map(|id| (agent.clone(), *id))
                .ok_or_else(|| SyncError::Sampling(format!("no id for network '{net_key}'")))
        })
        .collect::<Result<NetworkIntKeys, SyncError>>()?;
    Ok((network_int_keys, agent_net_keys))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn natural_order() {
        let sorted = sort_str_num(strings(&["agent_10", "agent_2", "agent_1", "Agent_3"]));
        assert_eq!(sorted, strings(&["agent_1", "agent_2", "Agent_3", "agent_10"]));
    }

    #[test]
    fn shared_network() {
        let mut rng = StdRng::seed_from_u64(0);
        let agents = strings(&["agent_1", "agent_0", "agent_2"]);
        let setup = vec![strings(&["network_agent"])];
        let ids = BTreeMap::from([("network_agent".to_string(), 0)]);
        let (int_keys, net_keys) = sample_new_agent_keys(&agents, &setup, &ids, &mut rng).unwrap();
        assert_eq!(net_keys.len(), 3);
        assert!(net_keys.values().all(|k| k == "network_agent"));
        assert!(int_keys.values().all(|&id| id == 0));
    }

    #[test]
    fn per_agent_networks_follow_agent_order() {
        let mut rng = StdRng::seed_from_u64(1);
        let agents = strings(&["agent_10", "agent_2"]);
        let setup = vec![strings(&["net_a", "net_b"])];
        let ids = BTreeMap::from([("net_a".to_string(), 4), ("net_b".to_string(), 7)]);
        let (int_keys, net_keys) = sample_new_agent_keys(&agents, &setup, &ids, &mut rng).unwrap();
        assert_eq!(net_keys["agent_2"], "net_a");
        assert_eq!(net_keys["agent_10"], "net_b");
        assert_eq!(int_keys["agent_2"], 4);
        assert_eq!(int_keys["agent_10"], 7);
    }

    #[test]
    fn missing_id_is_an_error() {
        let mut rng = StdRng::seed_from_u64(2);
        let agents = strings(&["agent_0"]);
        let setup = vec![strings(&["net_a"])];
        let result = sample_new_agent_keys(&agents, &setup, &BTreeMap::new(), &mut rng);
        assert!(matches!(result, Err(SyncError::Sampling(_))));
    }

    #[test]
    fn empty_setup_is_an_error() {
        let mut rng = StdRng::seed_from_u64(3);
        let agents = strings(&["agent_0"]);
        let result = sample_new_agent_keys(&agents, &[], &BTreeMap::new(), &mut rng);
        assert!(matches!(result, Err(SyncError::Sampling(_))));
    }
}
