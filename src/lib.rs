pub mod aggregator;
pub mod comms;
pub mod config;
pub mod context;
pub mod flow;
pub mod logger;
pub mod message;
pub mod node;
pub mod nodes;
pub mod pool;
pub mod sandbox;
pub mod topic;
