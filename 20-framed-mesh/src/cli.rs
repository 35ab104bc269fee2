use std::{path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand, ValueEnum, ValueHint};

use crate::{
    connection::{ConnectionOptions, OverflowPolicy},
    connector::Backoff,
    endpoint::Endpoint,
    frame::DEFAULT_MAX_FRAME_LEN,
    node::{ErrorPolicy, NodeConfig, Role, Routing},
    registry::DEFAULT_HISTORY_CAPACITY,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Accept peers and broadcast every evaluated result to all of them.
    Server(ServerArgs),
    /// Dial one server and answer what it sends.
    Client(ClientArgs),
    /// Accept peers and dial an upstream node at the same time.
    Peer(PeerArgs),
}

impl Command {
    pub fn role(&self) -> Role {
        match self {
            Command::Server(args) => Role::Server {
                listen: args.listen,
            },
            Command::Client(args) => Role::Client {
                remote: args.connect,
            },
            Command::Peer(args) => Role::Peer {
                listen: args.listen,
                remote: args.connect,
            },
        }
    }

    pub fn node_args(&self) -> &NodeArgs {
        match self {
            Command::Server(args) => &args.node,
            Command::Client(args) => &args.node,
            Command::Peer(args) => &args.node,
        }
    }

    pub fn node_config(&self) -> NodeConfig {
        let mut config = self.node_args().config(self.role());
        // A replying client facing a broadcasting server bounces every
        // result between the two forever.
        if matches!(self, Command::Client(_)) && config.routing.is_none() {
            config.routing = Some(Routing::Local);
        }
        config
    }
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address to accept peers on. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:5000")]
    pub listen: Endpoint,

    #[command(flatten)]
    pub node: NodeArgs,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the node to dial.
    #[arg(long, default_value = "127.0.0.1:5000")]
    pub connect: Endpoint,

    #[command(flatten)]
    pub node: NodeArgs,
}

#[derive(Args, Debug, Clone)]
pub struct PeerArgs {
    #[arg(long, default_value = "127.0.0.1:5001")]
    pub listen: Endpoint,

    /// Upstream node to dial.
    #[arg(long)]
    pub connect: Endpoint,

    #[command(flatten)]
    pub node: NodeArgs,
}

/// Settings shared by every role.
#[derive(Args, Debug, Clone)]
pub struct NodeArgs {
    /// Interpreter applied to every payload.
    #[arg(long, value_enum, default_value = "calc")]
    pub evaluator: EvaluatorKind,

    /// Where results of network payloads go. Defaults to `broadcast` for
    /// servers and peers, `local` for clients.
    #[arg(long, value_enum)]
    pub route: Option<Routing>,

    /// What to do with a payload that fails to evaluate.
    #[arg(long, value_enum, default_value = "reply")]
    pub on_error: ErrorPolicy,

    /// Number of broadcasts replayed to late joiners.
    #[arg(long, default_value_t = DEFAULT_HISTORY_CAPACITY)]
    pub history: usize,

    /// Largest frame accepted or sent, header included.
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_LEN)]
    pub max_frame_len: u32,

    /// Bound on frames waiting for a slow peer. Unbounded when omitted.
    #[arg(long)]
    pub queue_limit: Option<usize>,

    /// What a full write queue does with the next frame.
    #[arg(long, value_enum, default_value = "drop-oldest")]
    pub overflow: OverflowPolicy,

    /// First delay between dial attempts, in milliseconds.
    #[arg(long, default_value_t = 50)]
    pub retry_initial_ms: u64,

    /// Longest delay between dial attempts, in milliseconds.
    #[arg(long, default_value_t = 2000)]
    pub retry_max_ms: u64,

    /// Stop dialing after this many failures. Retries forever when omitted.
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// File evaluated and submitted once at startup.
    #[arg(long, value_hint = ValueHint::FilePath)]
    pub script: Option<PathBuf>,

    /// Expression evaluated and submitted at startup. May be repeated.
    #[arg(long = "expression", short = 'e')]
    pub expressions: Vec<String>,
}

impl NodeArgs {
    pub fn config(&self, role: Role) -> NodeConfig {
        NodeConfig {
            role,
            history_capacity: self.history,
            connection: ConnectionOptions {
                max_frame_len: self.max_frame_len,
                queue_limit: self.queue_limit,
                overflow: self.overflow,
            },
            backoff: Backoff {
                initial: Duration::from_millis(self.retry_initial_ms),
                max: Duration::from_millis(self.retry_max_ms),
                max_attempts: self.max_attempts,
                ..Backoff::default()
            },
            routing: self.route,
            on_eval_error: self.on_error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EvaluatorKind {
    /// Send every payload back unchanged.
    Echo,
    /// Prefix arithmetic such as `(+ 1 2)`.
    Calc,
}
