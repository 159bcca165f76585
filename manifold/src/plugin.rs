//! The plugin container.
//!
//! A `Plugin` collects everything a plugin binary registers --
//! handlers, outputs, devices, health checks, the dynamic
//! registration port -- and `run()` turns it into the running
//! system: it derives the ID namespace, constructs and freezes the
//! registries, starts the scheduler and the background tasks, and
//! serves RPC until a shutdown signal lands.

use crate::{
    cache::ReadingCache,
    config::{Config, DeviceConfig},
    health::{CheckFunc, HealthState},
    id::{self, Namespace},
    outputs::OutputRegistry,
    registry::DeviceRegistry,
    scheduler::Scheduler,
    server,
    service::Service,
    txn::Transactions,
};
use async_trait::async_trait;
use futures::future;
use manifold_api::{
    handler::{DeviceHandler, Name},
    types::{device::Device, output::Output, Error},
    Result,
};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

// How long shutdown waits for in-flight work before abandoning it.

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Identifying information for a plugin. The tag feeds the ID
/// namespace, so changing it changes every device ID.
#[derive(Clone, Debug)]
pub struct Metadata {
    pub name: String,
    pub maintainer: String,
    pub description: String,
    pub version: String,
}

impl Metadata {
    pub fn new(name: &str, maintainer: &str) -> Metadata {
        Metadata {
            name: name.into(),
            maintainer: maintainer.into(),
            description: String::new(),
            version: String::new(),
        }
    }

    pub fn with_description(mut self, description: &str) -> Metadata {
        self.description = description.into();
        self
    }

    pub fn with_version(mut self, version: &str) -> Metadata {
        self.version = version.into();
        self
    }

    /// The plugin's tag: `maintainer/name`, normalized to lower
    /// case with whitespace collapsed to dashes.
    pub fn tag(&self) -> String {
        let normalize = |s: &str| {
            s.to_lowercase()
                .split_whitespace()
                .collect::<Vec<_>>()
                .join("-")
        };

        format!(
            "{}/{}",
            normalize(&self.maintainer),
            normalize(&self.name)
        )
    }
}

/// The dynamic-registration port. A plugin that discovers devices
/// at startup (scanning a bus, querying a controller) implements
/// this; the runtime calls it once per `dynamicRegistration.config`
/// entry, during the startup window, before the registry freezes.
#[async_trait]
pub trait DeviceRegistrar: Send + Sync {
    async fn register(
        &self,
        cfg: &toml::value::Table,
    ) -> Result<Vec<DeviceConfig>>;
}

pub struct Plugin {
    meta: Metadata,
    config: Config,
    handlers: HashMap<Name, Arc<DeviceHandler>>,
    outputs: OutputRegistry,
    devices: Vec<DeviceConfig>,
    registrar: Option<Box<dyn DeviceRegistrar>>,
    checks: Vec<(String, CheckFunc)>,
}

impl Plugin {
    pub fn new(meta: Metadata, config: Config) -> Plugin {
        Plugin {
            meta,
            config,
            handlers: HashMap::new(),
            outputs: OutputRegistry::with_builtins(),
            devices: vec![],
            registrar: None,
            checks: vec![],
        }
    }

    /// Registers a device handler. Handler names are unique; every
    /// device names the handler that drives it.
    pub fn register_handler(
        &mut self,
        handler: DeviceHandler,
    ) -> Result<()> {
        if self.handlers.contains_key(&handler.name) {
            return Err(Error::Conflict(format!(
                "handler '{}' is already registered",
                &handler.name
            )));
        }

        self.handlers
            .insert(handler.name.clone(), Arc::new(handler));
        Ok(())
    }

    /// Registers a custom output alongside the built-ins.
    pub fn register_output(&mut self, output: Output) -> Result<()> {
        self.outputs.register(output)
    }

    /// Adds a device programmatically, alongside any from the
    /// configuration file.
    pub fn register_device(&mut self, device: DeviceConfig) {
        self.devices.push(device)
    }

    /// Registers a named health check, reported alongside the
    /// defaults.
    pub fn register_check<F>(&mut self, name: &str, check: F)
    where
        F: Fn() -> std::result::Result<(), String>
            + Send
            + Sync
            + 'static,
    {
        self.checks.push((name.to_string(), Arc::new(check)))
    }

    /// Installs the dynamic-registration port.
    pub fn set_registrar(&mut self, registrar: Box<dyn DeviceRegistrar>) {
        self.registrar = Some(registrar)
    }

    // Gathers every device description: configuration file entries,
    // programmatic registrations, then whatever the dynamic
    // registrar produces.

    async fn assemble_devices(&mut self) -> Result<Vec<DeviceConfig>> {
        let mut cfgs = self.config.device.clone();

        cfgs.append(&mut self.devices);

        if !self.config.dynamic_registration.config.is_empty() {
            let Some(registrar) = &self.registrar else {
                return Err(Error::Config(
                    "dynamicRegistration is configured but the \
                     plugin has no registrar"
                        .into(),
                ));
            };

            for entry in &self.config.dynamic_registration.config {
                cfgs.extend(registrar.register(entry).await?)
            }
        }

        Ok(cfgs)
    }

    // Builds the frozen device registry. Any problem here -- an
    // unknown handler or output, a duplicate ID -- is fatal at
    // startup.

    fn build_registry(
        &self,
        ns: &Namespace,
        cfgs: &[DeviceConfig],
    ) -> Result<DeviceRegistry> {
        let mut registry = DeviceRegistry::new();

        for cfg in cfgs {
            let handler_name = cfg.handler_name();
            let handler = self
                .handlers
                .get(handler_name)
                .cloned()
                .ok_or_else(|| {
                    Error::Config(format!(
                        "device of type '{}' names unknown handler \
                         '{}'",
                        &cfg.kind, handler_name
                    ))
                })?;
            let mut outputs = vec![];

            for name in &cfg.outputs {
                outputs.push(self.outputs.get(name).ok_or_else(
                    || {
                        Error::Config(format!(
                            "device of type '{}' names unknown \
                             output '{}'",
                            &cfg.kind, name
                        ))
                    },
                )?)
            }

            let component = match &handler.device_id {
                Some(f) => f(&cfg.data),
                None => id::default_component(
                    &cfg.kind,
                    &cfg.metadata,
                    &cfg.data,
                ),
            };
            let device = Device::create(
                ns.device_id(&component),
                cfg.kind.clone(),
                handler.name.clone(),
                cfg.metadata.clone(),
                cfg.data.clone(),
                outputs,
                cfg.scale,
                handler.capabilities(),
            );

            registry.add(device, handler)?
        }

        Ok(registry)
    }

    /// Runs the plugin until shutdown. This is the last call in a
    /// plugin binary's `main`.
    pub async fn run(mut self) -> Result<()> {
        init_logging(&self.config);

        info!(
            name = &self.meta.name,
            version = &self.meta.version,
            "starting plugin"
        );

        let ns =
            Namespace::build(&self.meta.tag(), &self.config.id).await?;

        // The startup window: every source of devices runs before
        // the registry freezes and the scheduler starts.

        let device_cfgs = self.assemble_devices().await?;
        let registry =
            Arc::new(self.build_registry(&ns, &device_cfgs)?);

        if registry.is_empty() {
            return Err(Error::Config("no devices configured".into()));
        }

        info!(devices = registry.len(), "device registry frozen");

        let cache =
            Arc::new(ReadingCache::new(&self.config.settings.cache));
        let txns =
            Transactions::new(self.config.settings.transaction.ttl());
        let health = Arc::new(HealthState::new(
            &self.config.settings,
            &self.config.health,
        ));

        for (name, check) in self.checks.drain(..) {
            health.register(&name, check)
        }

        let mut scheduler = Scheduler::new(
            registry.clone(),
            cache.clone(),
            txns.clone(),
            self.config.settings.clone(),
            health.clone(),
        );
        let service = Arc::new(Service::new(
            registry,
            cache.clone(),
            txns.clone(),
            scheduler.writer(),
            health.clone(),
            self.config.settings.write.interval(),
        ));

        let token = CancellationToken::new();
        let mut tasks = scheduler.start(&token);

        tasks.push(txns.start_sweeper(token.child_token()));

        if let Some(task) = cache.start_sweeper(token.child_token()) {
            tasks.push(task)
        }

        if let Some(task) = health
            .start_file_task(&self.config.health, token.child_token())
        {
            tasks.push(task)
        }

        let (server_task, _) = server::start(
            service,
            &self.config.network,
            token.child_token(),
        )
        .await?;

        tasks.push(server_task);

        // A ctrl-c (or SIGTERM from a supervisor wrapping it) fires
        // the hierarchical token; every task winds down from there.

        {
            let token = token.clone();

            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("shutdown signal received");
                    token.cancel()
                }
            });
        }

        wait_for_tasks(tasks, &token).await;

        // Anything a task didn't finish before being abandoned must
        // not linger as PENDING/WRITING forever.

        txns.fail_in_flight("write abandoned at shutdown");

        warn!("shutting down");
        Ok(())
    }
}

// Awaits every task, but only up to the grace period once shutdown
// has begun.

async fn wait_for_tasks(
    tasks: Vec<JoinHandle<()>>,
    token: &CancellationToken,
) {
    let grace = async {
        token.cancelled().await;
        tokio::time::sleep(SHUTDOWN_GRACE).await
    };

    tokio::select! {
        _ = future::join_all(tasks) => info!("all tasks stopped"),
        _ = grace => {
            warn!("grace period expired; abandoning remaining tasks")
        }
    }
}

fn init_logging(cfg: &Config) {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(cfg.log_level())
        .with_target(false)
        .finish();

    // A second plugin in the same process (tests do this) keeps the
    // first subscriber.

    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[cfg(test)]
mod tests {
    use super::*;
    use manifold_api::types::device::Value;

    fn read_handler(name: &str) -> DeviceHandler {
        DeviceHandler::new(name).with_read(|_| async { Ok(vec![]) })
    }

    fn temp_device(channel: i64) -> DeviceConfig {
        DeviceConfig {
            kind: "temperature".into(),
            handler: None,
            metadata: HashMap::new(),
            data: toml::value::Table::from_iter([(
                "channel".to_string(),
                toml::value::Value::Integer(channel),
            )]),
            outputs: vec!["temperature".into()],
            scale: None,
        }
    }

    fn plugin() -> Plugin {
        let mut plugin = Plugin::new(
            Metadata::new("fan", "acme"),
            Config::default(),
        );

        plugin
            .register_handler(read_handler("temperature"))
            .unwrap();
        plugin
    }

    async fn namespace(plugin: &Plugin) -> Namespace {
        Namespace::build(&plugin.meta.tag(), &plugin.config.id)
            .await
            .unwrap()
    }

    #[test]
    fn test_metadata_tag() {
        assert_eq!(
            Metadata::new("Fan Plugin", "Acme Corp").tag(),
            "acme-corp/fan-plugin"
        );
    }

    #[test]
    fn test_duplicate_handler_rejected() {
        let mut plugin = plugin();

        assert!(matches!(
            plugin.register_handler(read_handler("temperature")),
            Err(Error::Conflict(_))
        ));
    }

    // Device IDs are derived, stable, and unique: building the same
    // registry twice yields identical IDs, and registering the same
    // device twice is a conflict.

    #[tokio::test]
    async fn test_device_ids_are_stable() {
        let plugin = plugin();
        let ns = namespace(&plugin).await;
        let cfgs = vec![temp_device(1), temp_device(2)];
        let first = plugin.build_registry(&ns, &cfgs).unwrap();
        let second = plugin.build_registry(&ns, &cfgs).unwrap();

        let ids =
            |r: &DeviceRegistry| -> Vec<String> {
                r.iter()
                    .map(|e| e.device.id().to_string())
                    .collect()
            };

        assert_eq!(ids(&first), ids(&second));
        assert_ne!(ids(&first)[0], ids(&first)[1]);
    }

    #[tokio::test]
    async fn test_duplicate_device_rejected() {
        let plugin = plugin();
        let ns = namespace(&plugin).await;
        let cfgs = vec![temp_device(1), temp_device(1)];

        assert!(matches!(
            plugin.build_registry(&ns, &cfgs),
            Err(Error::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_custom_device_id_function() {
        let mut plugin = Plugin::new(
            Metadata::new("fan", "acme"),
            Config::default(),
        );

        plugin
            .register_handler(
                read_handler("temperature").with_device_id(|data| {
                    format!("serial-{}", data["serial"])
                }),
            )
            .unwrap();

        let ns = namespace(&plugin).await;
        let mut cfg = temp_device(1);

        cfg.data.insert(
            "serial".to_string(),
            toml::value::Value::String("ab12".into()),
        );

        let registry =
            plugin.build_registry(&ns, &[cfg.clone()]).unwrap();
        let expected = ns.device_id("serial-\"ab12\"");

        assert_eq!(
            registry.iter().next().unwrap().device.id(),
            expected
        );
    }

    #[tokio::test]
    async fn test_unknown_handler_is_fatal() {
        let plugin = plugin();
        let ns = namespace(&plugin).await;
        let mut cfg = temp_device(1);

        cfg.handler = Some("missing".into());

        assert!(matches!(
            plugin.build_registry(&ns, &[cfg]),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_output_is_fatal() {
        let plugin = plugin();
        let ns = namespace(&plugin).await;
        let mut cfg = temp_device(1);

        cfg.outputs = vec!["airflow".into()];

        assert!(matches!(
            plugin.build_registry(&ns, &[cfg]),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_capabilities_follow_handler() {
        let mut plugin = Plugin::new(
            Metadata::new("fan", "acme"),
            Config::default(),
        );

        plugin
            .register_handler(
                DeviceHandler::new("led")
                    .with_read(|_| async { Ok(vec![]) })
                    .with_write(|_, _| async { Ok(()) }),
            )
            .unwrap();

        let ns = namespace(&plugin).await;
        let cfg = DeviceConfig {
            kind: "led".into(),
            outputs: vec!["state".into()],
            ..DeviceConfig::default()
        };
        let registry = plugin.build_registry(&ns, &[cfg]).unwrap();
        let caps =
            registry.iter().next().unwrap().device.capabilities();

        assert!(caps.read);
        assert!(caps.write);
        assert!(!caps.listen);
    }

    struct FixedRegistrar;

    #[async_trait]
    impl DeviceRegistrar for FixedRegistrar {
        async fn register(
            &self,
            cfg: &toml::value::Table,
        ) -> Result<Vec<DeviceConfig>> {
            let count = cfg
                .get("count")
                .and_then(|v| v.as_integer())
                .unwrap_or(1);

            Ok((0..count).map(temp_device).collect())
        }
    }

    #[tokio::test]
    async fn test_dynamic_registration() {
        let mut plugin = plugin();

        plugin.config.dynamic_registration.config = vec![
            toml::value::Table::from_iter([(
                "count".to_string(),
                toml::value::Value::Integer(3),
            )]),
        ];
        plugin.set_registrar(Box::new(FixedRegistrar));

        let cfgs = plugin.assemble_devices().await.unwrap();

        assert_eq!(cfgs.len(), 3);
    }

    #[tokio::test]
    async fn test_dynamic_registration_needs_a_registrar() {
        let mut plugin = plugin();

        plugin.config.dynamic_registration.config =
            vec![toml::value::Table::new()];

        assert!(matches!(
            plugin.assemble_devices().await,
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_assemble_merges_sources() {
        let mut plugin = plugin();

        plugin.config.device = vec![temp_device(1)];
        plugin.register_device(temp_device(2));

        let cfgs = plugin.assemble_devices().await.unwrap();

        assert_eq!(cfgs.len(), 2);
    }

    // The scale knob flows from the device config into the device.

    #[tokio::test]
    async fn test_scale_is_carried() {
        let plugin = plugin();
        let ns = namespace(&plugin).await;
        let mut cfg = temp_device(1);

        cfg.scale = Some(0.001);

        let registry = plugin.build_registry(&ns, &[cfg]).unwrap();

        assert_eq!(
            registry.iter().next().unwrap().device.scale,
            Some(0.001)
        );

        // And readings scaled by it really change.

        let reading = manifold_api::types::device::Reading {
            ts: chrono::Utc::now(),
            kind: "temperature".into(),
            unit: None,
            value: Value::Int(1500),
            context: HashMap::new(),
            output: None,
        };

        assert_eq!(
            reading.scale(0.001).unwrap().value,
            Value::Flt(1.5)
        );
    }
}
