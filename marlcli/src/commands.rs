use super::*;

mod simulate;
pub use simulate::*;

mod inspect;
pub use inspect::*;

/// All CLI commands available in this binary.
#[derive(clap::Subcommand, Debug)]
pub enum Command {
    /// Run executors and trainers against an in-process parameter server node.
    #[command(alias = "s")]
    Simulate(Simulate),

    /// Print the parameters of a running HTTP node.
    #[command(alias = "i")]
    Inspect(Inspect),

    /// Add a number to a parameter of a running HTTP node.
    Add(Add),
}

#[derive(clap::Args, Debug)]
pub struct Simulate {
    /// Path to the simulation YAML file.
    path: PathBuf,
}

#[derive(clap::Args, Debug)]
pub struct Inspect {
    /// Address of the node, e.g. 127.0.0.1:8050.
    address: String,
    /// Parameters to print. All parameters if empty.
    names: Vec<String>,
    /// Print the parameters as JSON (Hint: redirect stdout)
    #[arg(short, long, default_value_t = false)]
    json: bool,
}

#[derive(clap::Args, Debug)]
pub struct Add {
    /// Address of the node, e.g. 127.0.0.1:8050.
    address: String,
    /// Name of the parameter.
    name: String,
    /// Added to every element of the parameter.
    #[arg(allow_negative_numbers = true)]
    delta: f64,
}

impl Command {
    pub fn run(self) {
        match self {
            Command::Simulate(args) => args.run(),
            Command::Inspect(args) => args.run(),
            Command::Add(args) => args.run(),
        }
    }
}
