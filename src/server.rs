//! Server assembly: builds the frame store, output driver and listeners from
//! a [`ServerConfig`] and runs each of them on its own thread.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::config::{ConfigError, OutputMode, ServerConfig};
use crate::driver::{DriverError, NopDriver, OutputDriver, RawFileDriver};
use crate::fallback::FallbackProducer;
use crate::ingest::FrameStore;
use crate::render::{RenderError, Renderer};
use crate::transport::{E131Transport, TcpTransport, TransportError, UdpTransport};

/// Errors that stop the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error("Failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("{0} thread panicked")]
    ThreadPanicked(&'static str),
    #[error("Failed to install Ctrl+C handler: {0}")]
    Ctrlc(#[from] ctrlc::Error),
}

/// Address a listener binds for `port`; `None` when the port is 0.
pub fn listen_addr(port: u16) -> Option<SocketAddr> {
    (port != 0).then(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
}

/// Set up the Ctrl+C handler.
///
/// This should be called once at program startup.
pub fn setup_ctrlc_handler(shutdown: Arc<AtomicBool>) -> Result<(), ServerError> {
    ctrlc::set_handler(move || {
        shutdown.store(true, Ordering::SeqCst);
        eprintln!("\nReceived Ctrl+C, shutting down...");
    })?;
    Ok(())
}

pub struct Server {
    config: ServerConfig,
    store: Arc<FrameStore>,
    driver: Box<dyn OutputDriver>,
}

impl Server {
    /// Validate `config` and open the configured output driver.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;
        let driver: Box<dyn OutputDriver> = match (config.output.mode, &config.output.path) {
            (OutputMode::Raw, Some(path)) => Box::new(RawFileDriver::open(path, config.layout())?),
            // validate() rejects raw output without a path
            _ => Box::new(NopDriver::new()),
        };
        Self::with_driver(config, driver)
    }

    /// Build a server around an already constructed driver.
    pub fn with_driver(
        config: ServerConfig,
        driver: Box<dyn OutputDriver>,
    ) -> Result<Self, ServerError> {
        config.validate()?;
        let store = Arc::new(FrameStore::new(config.layout(), config.luts()));
        Ok(Server {
            config,
            store,
            driver,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<FrameStore> {
        Arc::clone(&self.store)
    }

    /// Bind every enabled listener, then run until `shutdown` is raised or
    /// the render loop fails.
    pub fn run(self, shutdown: Arc<AtomicBool>) -> Result<(), ServerError> {
        let Server {
            config,
            store,
            driver,
        } = self;
        let layout = config.layout();
        log::info!(
            "[server] {} strips x {} LEDs, order {}, output {}",
            layout.strips,
            layout.leds_per_strip,
            config.strips.channel_order,
            config.output.mode
        );

        let network = &config.network;
        let tcp = match listen_addr(network.tcp_port) {
            Some(addr) => {
                let json: Arc<str> = Arc::from(config.to_json()?);
                Some(TcpTransport::bind(addr, Arc::clone(&store), json)?)
            }
            None => None,
        };
        let udp = match listen_addr(network.udp_port) {
            Some(addr) => match UdpTransport::bind(addr, Arc::clone(&store)) {
                Ok(t) => Some(t),
                Err(e @ TransportError::PacketTooLarge { .. }) => {
                    log::error!("{}", e);
                    None
                }
                Err(e) => return Err(e.into()),
            },
            None => None,
        };
        let e131 = match listen_addr(network.e131_port) {
            Some(addr) => Some(E131Transport::bind(addr, Arc::clone(&store))?),
            None => None,
        };

        let mut workers: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        let render = {
            let mut renderer = Renderer::new(Arc::clone(&store), driver, config.render_settings());
            let shutdown = Arc::clone(&shutdown);
            spawn("render", move || {
                let result = renderer.run(&shutdown);
                if result.is_err() {
                    shutdown.store(true, Ordering::SeqCst);
                }
                result
            })?
        };

        // A failed spawn stops every thread started so far
        if let Some(tcp) = tcp {
            let flag = Arc::clone(&shutdown);
            let handle = raise_on_error(spawn("tcp", move || tcp.run(flag)), &shutdown)?;
            workers.push(("tcp", handle));
        }
        if let Some(udp) = udp {
            let flag = Arc::clone(&shutdown);
            let handle = raise_on_error(spawn("udp", move || udp.run(&flag)), &shutdown)?;
            workers.push(("udp", handle));
        }
        if let Some(e131) = e131 {
            let flag = Arc::clone(&shutdown);
            let handle = raise_on_error(spawn("e131", move || e131.run(&flag)), &shutdown)?;
            workers.push(("e131", handle));
        }
        // Runs in every mode; `none` blanks the strips once remote data stops
        let mut producer = FallbackProducer::new(Arc::clone(&store), config.fallback.mode);
        let flag = Arc::clone(&shutdown);
        let handle = raise_on_error(spawn("demo", move || producer.run(&flag)), &shutdown)?;
        workers.push(("demo", handle));

        let render_result = render
            .join()
            .map_err(|_| ServerError::ThreadPanicked("render"))?;
        // Listeners only stop once the flag is up, also after a render failure
        shutdown.store(true, Ordering::SeqCst);
        for (name, handle) in workers {
            handle.join().map_err(|_| ServerError::ThreadPanicked(name))?;
        }

        render_result?;
        log::info!("[server] Shut down cleanly");
        Ok(())
    }
}

/// Raise `shutdown` when `result` failed, so threads already running stop.
fn raise_on_error<T>(
    result: Result<T, ServerError>,
    shutdown: &AtomicBool,
) -> Result<T, ServerError> {
    if result.is_err() {
        shutdown.store(true, Ordering::SeqCst);
    }
    result
}

fn spawn<T, F>(name: &'static str, f: F) -> Result<JoinHandle<T>, ServerError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map_err(|source| ServerError::Spawn { name, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MemoryDriver;
    use crate::fallback::DemoMode;
    use crate::frame::SlotRole;
    use std::time::{Duration, Instant};

    fn offline_config() -> ServerConfig {
        let mut config = ServerConfig::default();
        config.network.tcp_port = 0;
        config.network.udp_port = 0;
        config.network.e131_port = 0;
        config.strips.used_strip_count = 2;
        config.strips.leds_per_strip = 4;
        config
    }

    #[test]
    fn test_listen_addr() {
        assert_eq!(listen_addr(0), None);
        assert_eq!(listen_addr(7890), Some("0.0.0.0:7890".parse().unwrap()));
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let mut config = offline_config();
        config.strips.used_strip_count = 0;
        assert!(matches!(
            Server::new(config),
            Err(ServerError::Config(ConfigError::Invalid(_)))
        ));
    }

    #[test]
    fn test_store_uses_config_layout() {
        let server = Server::new(offline_config()).unwrap();
        let layout = server.store().layout();
        assert_eq!(layout.strips, 2);
        assert_eq!(layout.leds_per_strip, 4);
    }

    #[test]
    fn test_demo_frames_reach_driver() {
        let mut config = offline_config();
        config.fallback.mode = DemoMode::Power;
        config.render.rate_hz = 100;
        let driver = MemoryDriver::new(config.layout());
        let handle = driver.handle();
        let server = Server::with_driver(config, Box::new(driver)).unwrap();

        let shutdown = Arc::new(AtomicBool::new(false));
        let runner = {
            let shutdown = Arc::clone(&shutdown);
            thread::spawn(move || server.run(shutdown))
        };

        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.commits() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        shutdown.store(true, Ordering::SeqCst);
        runner.join().unwrap().unwrap();

        assert!(handle.commits() > 0);
    }

    #[test]
    fn test_failed_spawn_raises_shutdown() {
        let shutdown = AtomicBool::new(false);
        assert_eq!(raise_on_error(Ok::<u8, ServerError>(1), &shutdown).unwrap(), 1);
        assert!(!shutdown.load(Ordering::SeqCst));

        let failed: Result<(), ServerError> = Err(ServerError::Spawn {
            name: "tcp",
            source: io::Error::new(io::ErrorKind::WouldBlock, "no threads"),
        });
        assert!(raise_on_error(failed, &shutdown).is_err());
        assert!(shutdown.load(Ordering::SeqCst));
    }

    #[test]
    fn test_none_mode_blanks_strips_without_remote_data() {
        let mut config = offline_config();
        config.fallback.mode = DemoMode::None;
        config.render.interpolation = false;
        let driver = MemoryDriver::new(config.layout());
        let handle = driver.handle();
        let server = Server::with_driver(config, Box::new(driver)).unwrap();
        let store = server.store();
        // Stale remote content that must not stay on the strips
        store.submit_frame_at(&[200; 24], true, Instant::now() - Duration::from_secs(10));

        let shutdown = Arc::new(AtomicBool::new(false));
        let runner = {
            let shutdown = Arc::clone(&shutdown);
            thread::spawn(move || server.run(shutdown))
        };

        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.pixel(1, 3) != Some([0, 0, 0]) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        shutdown.store(true, Ordering::SeqCst);
        runner.join().unwrap().unwrap();

        assert_eq!(handle.pixel(0, 0), Some([0, 0, 0]));
        assert_eq!(handle.pixel(1, 3), Some([0, 0, 0]));
        assert!(!store.lock().slot(SlotRole::Current).pixels().iter().any(|p| p.r == 200));
    }
}
