mod api;
mod channel_map;
mod config;
mod device;
mod error;
mod fade;
mod frontend;
mod http;
mod store;
mod websocket;

use config::Config;
use device::{DeviceWriter, PwmDevice, SimulatedPwm, SysfsPwm};
use fade::FadeEngine;
use http::{HttpContext, http_thread};
use store::ChannelStore;
use websocket::websocket_thread;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

/// Fade a bank of PWM outputs toward targets set over HTTP.
#[derive(Debug, Parser)]
#[command(version)]
struct Args {
    /// JSON configuration file; defaults are used when it does not exist.
    #[arg(short, long, default_value = "pwmfade.json")]
    config: PathBuf,
    /// Override the HTTP listen address.
    #[arg(short, long)]
    listen: Option<String>,
    /// Drive an in-memory PWM bank instead of sysfs.
    #[arg(long)]
    simulate: bool,
    /// Write the effective configuration to the config path and exit.
    #[arg(long)]
    write_config: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::new()
        .filter_module("pwmfade", log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let args = Args::parse();
    let mut config = Config::load(&args.config)?;
    if let Some(listen) = args.listen {
        config.http_listen = listen;
    }
    if args.write_config {
        config.save(&args.config)?;
        info!("[CONFIG] wrote {}", args.config.display());
        return Ok(());
    }

    info!("Starting PWM fader with {} channels", config.channel_count);
    let map = config.channel_map()?;

    let mut pwm: Box<dyn PwmDevice> = if args.simulate {
        info!("[PWM] using simulated outputs");
        Box::new(SimulatedPwm::new())
    } else {
        Box::new(SysfsPwm::new(config.pwm_chip.clone()))
    };
    device::initialize(&mut *pwm, &map, config.period_ns, config.provision_poll());
    let seed = device::read_back(&*pwm, &map);

    let store = Arc::new(ChannelStore::new(map, config.fade_speed));
    store.seed(&seed);
    let snapshot = store.read_all();
    info!("[PWM] current {:?}", snapshot.current);
    info!("[PWM] target {:?}", snapshot.target);

    let outputs = store.map().outputs();
    let writer = DeviceWriter::spawn(Arc::from(pwm), &outputs, config.device_timeout())
        .context("starting device writers")?;
    let fade = FadeEngine::new(Arc::clone(&store), config.period_ns)
        .spawn(writer, config.tick())
        .context("starting fade engine")?;

    if let Some(addr) = &config.ws_listen {
        let server = TcpListener::bind(addr).with_context(|| format!("binding {}", addr))?;
        let store = Arc::clone(&store);
        let interval = config.ws_interval();
        thread::spawn(move || {
            websocket_thread(server, store, interval);
        });
    }

    let listener = TcpListener::bind(&config.http_listen)
        .with_context(|| format!("binding {}", config.http_listen))?;
    let ctx = Arc::new(HttpContext {
        store,
        frontend_dir: config.frontend_dir.clone(),
    });
    http_thread(listener, ctx);

    fade.shutdown();
    Ok(())
}
