//! Core of the metrics gateway.
//!
//! Everything that does not speak a backend protocol or HTTP lives here:
//! the catalog pull path (records, filter chains, catalogs, the searcher),
//! the persisted library (entities, the `Store` contract, the typed
//! `Library` layer) and the query path (template and group expansion,
//! dispatch, normalization, operators and summaries).

pub mod catalog;
pub mod connector;
pub mod dispatch;
pub mod error;
pub mod expand;
pub mod filter;
pub mod library;
pub mod model;
pub mod pattern;
pub mod query;
pub mod record;
pub mod searcher;
pub mod series;
pub mod store;
pub mod template;
pub mod timerange;

pub use catalog::Catalog;
pub use connector::{Connector, ConnectorError, ConnectorRegistry, PointsQuery, QueryMetric};
pub use error::ErrorKind;
pub use filter::FilterChain;
pub use library::Library;
pub use query::{PointsRequest, PointsResponse, QueryEngine};
pub use record::{Attributes, Record};
pub use searcher::Searcher;
pub use series::{Point, Series};

/// Product version, used in `User-Agent` headers and the health endpoint.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
