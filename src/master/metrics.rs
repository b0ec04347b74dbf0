//! Cluster-shape gauges exposed on the admin server's `/metrics` route
//! when the `metrics` Cargo feature is enabled. Disabled by default;
//! when off, `MetricsRegistry` is a zero-cost stub so `admin.rs` never
//! needs its own `#[cfg]` branching.

#[cfg(feature = "metrics")]
mod enabled {
	use prometheus::{Encoder, IntGauge, Registry, TextEncoder};

	use meridian_meta::MetaWriter;
	use meridian_util::error::{Error, ErrorKind, Result};

	pub struct MetricsRegistry {
		registry: Registry,
		servers: IntGauge,
		dbs: IntGauge,
		spaces: IntGauge,
		partitions: IntGauge,
	}

	impl MetricsRegistry {
		pub fn new() -> Self {
			let registry = Registry::new();
			let servers = IntGauge::new("meridian_servers", "registered servers").unwrap();
			let dbs = IntGauge::new("meridian_dbs", "databases").unwrap();
			let spaces = IntGauge::new("meridian_spaces", "spaces across all databases").unwrap();
			let partitions = IntGauge::new("meridian_partitions", "partitions across all spaces").unwrap();
			registry.register(Box::new(servers.clone())).unwrap();
			registry.register(Box::new(dbs.clone())).unwrap();
			registry.register(Box::new(spaces.clone())).unwrap();
			registry.register(Box::new(partitions.clone())).unwrap();
			MetricsRegistry { registry, servers, dbs, spaces, partitions }
		}

		/// Re-reads cluster shape from the metadata store and updates every gauge.
		pub fn refresh(&self, meta: &dyn MetaWriter) -> Result<()> {
			self.dbs.set(meta.list_dbs()?.len() as i64);
			let spaces = meta.list_all_spaces()?;
			self.spaces.set(spaces.len() as i64);
			let partition_count: usize = spaces.iter().map(|s| s.partitions.len()).sum();
			self.partitions.set(partition_count as i64);
			self.servers.set(meta.list_servers()?.len() as i64);
			Ok(())
		}

		pub fn render(&self) -> Result<String> {
			let mut buf = Vec::new();
			TextEncoder::new()
				.encode(&self.registry.gather(), &mut buf)
				.map_err(|e| Error::new(ErrorKind::InternalError, e.to_string()))?;
			String::from_utf8(buf).map_err(|e| Error::new(ErrorKind::InternalError, e.to_string()))
		}
	}

	impl Default for MetricsRegistry {
		fn default() -> Self {
			Self::new()
		}
	}

	#[cfg(test)]
	mod tests {
		use super::*;
		use meridian_meta::{Db as DbEntity, MetaStore, MetaWriter};

		#[test]
		fn refresh_reflects_store_contents() {
			let store = MetaStore::new(meridian_db::Db::open_memory());
			store.create_db(&DbEntity { id: 1, name: "d1".into(), ps: vec![] }).unwrap();
			let registry = MetricsRegistry::new();
			registry.refresh(&store).unwrap();
			let rendered = registry.render().unwrap();
			assert!(rendered.contains("meridian_dbs 1"));
		}
	}
}

#[cfg(not(feature = "metrics"))]
mod disabled {
	use meridian_meta::MetaWriter;
	use meridian_util::error::Result;

	#[derive(Default)]
	pub struct MetricsRegistry;

	impl MetricsRegistry {
		pub fn new() -> Self {
			MetricsRegistry
		}

		pub fn refresh(&self, _meta: &dyn MetaWriter) -> Result<()> {
			Ok(())
		}

		pub fn render(&self) -> Result<String> {
			Ok(String::from("# metrics feature disabled\n"))
		}
	}
}

#[cfg(feature = "metrics")]
pub use enabled::MetricsRegistry;

#[cfg(not(feature = "metrics"))]
pub use disabled::MetricsRegistry;
