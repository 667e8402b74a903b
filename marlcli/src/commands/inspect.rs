/// Commands that talk to a running HTTP node.
use std::collections::BTreeMap;

use itertools::Itertools;
use marllib::node::RemoteParameterServer;
use marllib::types::ParamValue;
use server::client::HttpParameterServer;

use super::*;

fn connect(address: &str) -> HttpParameterServer {
    match HttpParameterServer::connect(address) {
        Ok(node) => node,
        Err(e) => fatal_error!(1, "Cannot connect to {address}: {e}"),
    }
}

fn describe(value: &ParamValue) -> String {
    match value {
        ParamValue::Scalar(v) => format!("{v}"),
        ParamValue::Array(a) => format!("array {:?} {}", a.shape(), a),
        ParamValue::Sequence(seq) => format!(
            "sequence [{}]",
            seq.iter().map(|a| format!("{:?}", a.shape())).join(", ")
        ),
        ParamValue::Mapping(map) => match serde_json::to_string(map) {
            Ok(json) => format!("mapping {json}"),
            Err(_) => format!("mapping with {} entries", map.len()),
        },
        ParamValue::Bytes(bytes) => format!("<{} bytes>", bytes.len()),
    }
}

impl Inspect {
    pub fn run(self) {
        let Inspect {
            address,
            names,
            json,
        } = self;
        let node = connect(&address);

        let names = if names.is_empty() {
            match node.keys() {
                Ok(keys) => keys,
                Err(e) => fatal_error!(1, "Cannot list parameters: {e}"),
            }
        } else {
            names
        };
        let params = match node.get_parameters(names).result() {
            Ok(params) => params,
            Err(e) => fatal_error!(1, "Cannot get parameters: {e}"),
        };

        if json {
            match serde_json::to_string_pretty(&params) {
                Ok(s) => println!("{s}"),
                Err(e) => fatal_error!(1, "Error while serializing parameters: {}", e),
            }
            return;
        }
        for (name, value) in params.iter() {
            println!("{:24}{}", format!("{name}:").bold(), describe(value));
        }
        if let Ok(stats) = node.stats() {
            println!(
                "\n{} gets: {} | sets: {} | adds: {}",
                "Served".dimmed().bold(),
                stats.gets,
                stats.sets,
                stats.adds
            );
        }
    }
}

impl Add {
    pub fn run(self) {
        let Add {
            address,
            name,
            delta,
        } = self;
        let node = connect(&address);
        let params = BTreeMap::from([(name.clone(), ParamValue::Scalar(delta))]);
        match node.add_to_parameters(params).result() {
            Ok(()) => println!("{} {delta} to {}", "Added".green().bold(), name.bold()),
            Err(e) => fatal_error!(1, "Cannot add to {name}: {e}"),
        }
    }
}
