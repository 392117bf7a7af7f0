//! Backend connectors for the metrics gateway.
//!
//! | Type       | Backend                          |
//! |------------|----------------------------------|
//! | `facette`  | another gateway instance         |
//! | `graphite` | Graphite web (`/render`)         |
//! | `kairosdb` | KairosDB REST API                |
//! | `influxdb` | InfluxDB 2.x (Flux)              |

mod http;
mod pattern;

pub mod facette;
pub mod graphite;
pub mod influxdb;
pub mod kairosdb;

#[cfg(test)]
mod testing;

use gateway_core::ConnectorRegistry;

/// Registers every connector type shipped with this crate.
pub fn register_all(registry: &mut ConnectorRegistry) {
    registry.register("facette", facette::FacetteConnector::factory);
    registry.register("graphite", graphite::GraphiteConnector::factory);
    registry.register("influxdb", influxdb::InfluxDbConnector::factory);
    registry.register("kairosdb", kairosdb::KairosDbConnector::factory);
}

/// A registry holding every built-in connector type.
pub fn registry() -> ConnectorRegistry {
    let mut registry = ConnectorRegistry::new();
    register_all(&mut registry);
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_core::connector::Settings;

    #[test]
    fn builtin_types_are_registered() {
        let registry = registry();
        assert_eq!(registry.types().collect::<Vec<_>>(), vec!["facette", "graphite", "influxdb", "kairosdb"]);

        let connector = registry
            .create("kairosdb", "kairos", &Settings::new().with("url", "http://localhost:8080"))
            .unwrap();
        assert_eq!(connector.name(), "kairos");
        assert!(registry.create("rrd", "x", &Settings::new()).is_err());
    }
}
