//! Driver entry point and the process-wide transport context
//!
//! The transport context is created on the first open and lives for the
//! rest of the process. Channels are opened once per storage-agent address
//! and shared by every vdisk that talks to that agent.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};
use vxhs_common::{ConfigError, DriverConfig, VDiskConfig};

use crate::completion::{EventLoop, ManualEventLoop, completion_queue, transport_callback};
use crate::error::{BlockResult, OpenError};
use crate::transport::{
    ChannelHandle, Transport, TransportCallback, TransportProvider, TransportResult,
};
use crate::vdisk::{Target, VDisk, VDiskShared};

/// Channels keyed by agent address, shared across vdisks
pub struct ChannelPool {
    transport: Arc<dyn Transport>,
    channels: RwLock<HashMap<String, ChannelHandle>>,
}

impl ChannelPool {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            channels: RwLock::new(HashMap::new()),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Channel to `address`, opening it on first use
    pub fn get_or_connect(&self, address: &str) -> TransportResult<ChannelHandle> {
        if let Some(channel) = self.channels.read().get(address) {
            return Ok(*channel);
        }

        let mut channels = self.channels.write();
        // Another open may have connected while we waited
        if let Some(channel) = channels.get(address) {
            return Ok(*channel);
        }

        let channel = self.transport.open_channel(address)?;
        info!("opened channel {:?} to {}", channel, address);
        channels.insert(address.to_string(), channel);
        Ok(channel)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.read().len()
    }
}

impl std::fmt::Debug for ChannelPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelPool")
            .field("channels", &*self.channels.read())
            .finish_non_exhaustive()
    }
}

/// Opens vdisks over one transport context
pub struct VxhsDriver {
    provider: Arc<dyn TransportProvider>,
    context: Mutex<Option<Arc<ChannelPool>>>,
    settings: DriverConfig,
}

impl VxhsDriver {
    pub fn new(provider: Arc<dyn TransportProvider>) -> Self {
        Self::with_settings(provider, DriverConfig::default())
    }

    pub fn with_settings(provider: Arc<dyn TransportProvider>, settings: DriverConfig) -> Self {
        Self {
            provider,
            context: Mutex::new(None),
            settings,
        }
    }

    pub fn settings(&self) -> &DriverConfig {
        &self.settings
    }

    /// The transport context, created on first use
    fn context(&self) -> Result<Arc<ChannelPool>, OpenError> {
        let mut context = self.context.lock();
        if let Some(pool) = context.as_ref() {
            return Ok(Arc::clone(pool));
        }

        let callback: TransportCallback = Arc::new(transport_callback);
        let transport = self
            .provider
            .init(callback)
            .map_err(|e| OpenError::TransportInit(e.to_string()))?;
        info!("transport context initialized");

        let pool = Arc::new(ChannelPool::new(transport));
        *context = Some(Arc::clone(&pool));
        Ok(pool)
    }

    /// Open the vdisk on its primary host and register its completion
    /// reader with `event_loop`
    pub fn open(&self, config: &VDiskConfig, event_loop: &dyn EventLoop) -> BlockResult<VDisk> {
        config.validate()?;
        let primary = config.primary().ok_or(ConfigError::EmptyHostList)?;
        let pool = self.context()?;

        let address = primary.agent_uri();
        let channel = pool
            .get_or_connect(&address)
            .map_err(|source| OpenError::Unreachable {
                address: address.clone(),
                source,
            })?;

        let path = config.device_path();
        let device = pool
            .transport()
            .open_device(channel, &path)
            .map_err(|source| OpenError::DeviceOpen {
                path: path.clone(),
                source,
            })?;
        debug!("opened {} on {} as {:?}", path, address, device);

        let (sender, reader) = completion_queue(&config.vdisk_id);
        let shared = Arc::new(VDiskShared::new(
            config,
            pool,
            self.settings.clone(),
            Target { channel, device },
            sender,
        ));
        event_loop.register(reader);

        info!(
            "opened vdisk {} on {} ({} host(s))",
            config.vdisk_id,
            primary,
            config.hosts.len()
        );
        Ok(VDisk::new(shared))
    }

    /// Parse a `vxhs://` URI or JSON target and open it
    pub fn open_target(&self, target: &str, event_loop: &dyn EventLoop) -> BlockResult<VDisk> {
        let config = VDiskConfig::parse(target)?;
        self.open(&config, event_loop)
    }

    /// Check that `target` names a vdisk a storage agent will open: parse
    /// it, open the device on the primary host and close it again. The agent
    /// provisions vdisks, so nothing is created here.
    pub fn create(&self, target: &str) -> BlockResult<VDiskConfig> {
        let config = VDiskConfig::parse(target)?;
        let vdisk = self.open(&config, &ManualEventLoop::new())?;
        vdisk.close();
        info!("validated vdisk {}", config.vdisk_id);
        Ok(config)
    }

    /// Channel pool of the transport context, if one was created
    pub fn channel_pool(&self) -> Option<Arc<ChannelPool>> {
        self.context.lock().clone()
    }
}

impl std::fmt::Debug for VxhsDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VxhsDriver")
            .field("settings", &self.settings)
            .field("initialized", &self.context.lock().is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BlockError;
    use crate::loopback::LoopbackCluster;

    fn cluster() -> Arc<LoopbackCluster> {
        let cluster = Arc::new(LoopbackCluster::new());
        cluster.add_agent("10.0.0.1", 9999);
        cluster.add_agent("10.0.0.2", 9999);
        cluster.create_disk("/dev/of/vdisk/{a}", 1 << 20);
        cluster.create_disk("/dev/of/vdisk/{b}", 1 << 20);
        cluster
    }

    #[test]
    fn test_context_initialized_once() {
        let cluster = cluster();
        let driver = VxhsDriver::new(cluster.clone());
        let event_loop = ManualEventLoop::new();
        assert!(driver.channel_pool().is_none());

        let a = driver
            .open_target("vxhs://10.0.0.1:9999/{a}", &event_loop)
            .unwrap();
        let b = driver
            .open_target("vxhs://10.0.0.1:9999/{b}", &event_loop)
            .unwrap();

        assert_eq!(cluster.init_count(), 1);
        assert_eq!(driver.channel_pool().unwrap().channel_count(), 1);
        assert_eq!(event_loop.reader_count(), 2);
        assert_eq!(a.device_path(), "/dev/of/vdisk/{a}");
        assert_eq!(b.vdisk_id(), "{b}");
    }

    #[test]
    fn test_open_json_target() {
        let driver = VxhsDriver::new(cluster());
        let event_loop = ManualEventLoop::new();

        let vdisk = driver
            .open_target(
                r#"json:{"driver":"vxhs","vdisk_id":"{a}","server":[{"host":"10.0.0.1","port":"9999"},{"host":"10.0.0.2","port":9999}]}"#,
                &event_loop,
            )
            .unwrap();
        assert_eq!(vdisk.current_host_idx(), 0);
        assert_eq!(vdisk.current_host().unwrap().host, "10.0.0.1");
    }

    #[test]
    fn test_open_errors() {
        let driver = VxhsDriver::new(cluster());
        let event_loop = ManualEventLoop::new();

        let err = driver
            .open_target("vxhs://10.0.0.9:9999/{a}", &event_loop)
            .unwrap_err();
        assert!(matches!(
            err,
            BlockError::Open(OpenError::Unreachable { .. })
        ));
        assert!(err.is_open_error());

        let err = driver
            .open_target("vxhs://10.0.0.1:9999/{missing}", &event_loop)
            .unwrap_err();
        assert!(matches!(err, BlockError::Open(OpenError::DeviceOpen { .. })));

        let err = driver
            .open_target("nbd://10.0.0.1/{a}", &event_loop)
            .unwrap_err();
        assert!(matches!(err, BlockError::Config(_)));
        assert_eq!(err.errno(), libc::EINVAL);

        let err = driver
            .open(&VDiskConfig::new("{a}", Vec::new()), &event_loop)
            .unwrap_err();
        assert!(matches!(err, BlockError::Config(ConfigError::EmptyHostList)));
        assert_eq!(event_loop.reader_count(), 0);
    }

    #[test]
    fn test_create_validates_target() {
        let cluster = cluster();
        let driver = VxhsDriver::new(cluster.clone());

        let config = driver
            .create("vxhs://10.0.0.1:9999/{a%7Dvxhs://10.0.0.2:9999/")
            .unwrap();
        assert_eq!(config.vdisk_id, "{a}");
        assert_eq!(config.hosts.len(), 2);
        assert_eq!(cluster.init_count(), 1);

        let err = driver.create("vxhs://10.0.0.1:9999/{missing}").unwrap_err();
        assert!(matches!(err, BlockError::Open(OpenError::DeviceOpen { .. })));
        let err = driver.create("vxhs://10.0.0.1:9999/").unwrap_err();
        assert!(matches!(err, BlockError::Config(_)));

        // The vdisk opens normally afterwards
        let event_loop = ManualEventLoop::new();
        let vdisk = driver
            .open_target("vxhs://10.0.0.1:9999/{a}", &event_loop)
            .unwrap();
        assert!(!vdisk.is_closed());
        assert_eq!(driver.channel_pool().unwrap().channel_count(), 1);
    }

    #[test]
    fn test_secondary_channel_opened_lazily() {
        let cluster = cluster();
        let driver = VxhsDriver::new(cluster.clone());
        let event_loop = ManualEventLoop::new();

        // The secondary agent being down does not block open
        cluster.set_agent_up("of://10.0.0.2:9999", false);
        let vdisk = driver
            .open_target(
                "vxhs://10.0.0.1:9999/{a%7Dvxhs://10.0.0.2:9999/",
                &event_loop,
            )
            .unwrap();
        assert_eq!(vdisk.vdisk_id(), "{a}");
        assert_eq!(driver.channel_pool().unwrap().channel_count(), 1);
    }
}
