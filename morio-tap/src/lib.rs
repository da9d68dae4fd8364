/*!
 * MORIO TAP
 *
 * Consumes broker topics, routes every record to the processors subscribed
 * to its topic, keeps throughput counters and buffers derived data (audit
 * trails, events, healthchecks, log lines, metricsets, notes) in an
 * ephemeral key/value store read by dashboards.
 *
 * Flow: broker consumer -> Dispatcher -> Processor -> (Cache | Producer | Inventory)
 * The throughput reporter runs on its own timer over the counters the
 * dispatcher writes.
 */

pub mod broker;
pub mod cache;
pub mod config;
pub mod counters;
pub mod dispatcher;
pub mod error;
pub mod inventory;
pub mod models;
pub mod processors;
pub mod produce;
pub mod store;
pub mod tools;

pub use cache::{Cache, CachePolicies};
pub use config::TapConfig;
pub use counters::{Counters, SharedCounters, ThroughputReporter};
pub use dispatcher::{DispatchReport, Dispatcher};
pub use error::TapError;
pub use models::{Envelope, InboundMessage, OutboundRecord};
pub use processors::{Processor, ProcessorRegistry};
pub use produce::{Producer, Publisher, StructuredInput};
pub use tools::Tools;
