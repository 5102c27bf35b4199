//! pktforge engine binary
//!
//! Brings up the ports and the engine, then serves the JSON control
//! socket until a shutdown signal arrives. Exit code 0 on a clean stop,
//! non-zero on initialization failure.

use pktforge::control::{ControlServer, DEFAULT_SOCKET_PATH};
use pktforge::memory::MbufPool;
use pktforge::port::{parse_port_spec, BurstPort, LoopbackPort, PcapPort};
use pktforge::utils::cpu::parse_cpu_list;
use pktforge::{Engine, EngineConfig, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

struct Options {
    ports: Vec<(String, f64)>,
    loopback: bool,
    cores: Option<Vec<usize>>,
    socket_path: String,
    pool_size: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            ports: Vec::new(),
            loopback: false,
            cores: None,
            socket_path: DEFAULT_SOCKET_PATH.to_string(),
            pool_size: 8192,
        }
    }
}

fn usage(program: &str) {
    eprintln!("Usage: {} [options]", program);
    eprintln!("Options:");
    eprintln!("  --ports <name[@mbps],...>   interfaces to drive via libpcap");
    eprintln!("  --loopback                  use an in-memory loopback port");
    eprintln!("  --cores <list>              worker cores, e.g. 1-3 or 1,2,5");
    eprintln!("  --socket <path>             control socket path override");
    eprintln!("  --pool-size <n>             mbufs per NUMA pool");
}

fn next_arg<'a>(args: &'a [String], i: &mut usize) -> std::result::Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(|s| s.as_str())
        .ok_or_else(|| format!("missing value for {}", args[*i - 1]))
}

fn parse_args(args: &[String]) -> std::result::Result<Options, String> {
    let mut opts = Options::default();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "--ports" => {
                for spec in next_arg(args, &mut i)?.split(',') {
                    let parsed = parse_port_spec(spec).map_err(|e| e.to_string())?;
                    opts.ports.push(parsed);
                }
            }
            "--loopback" => opts.loopback = true,
            "--cores" => {
                let cores = parse_cpu_list(next_arg(args, &mut i)?);
                if cores.is_empty() {
                    return Err("empty core list".to_string());
                }
                opts.cores = Some(cores);
            }
            "--socket" => opts.socket_path = next_arg(args, &mut i)?.to_string(),
            "--pool-size" => {
                opts.pool_size = next_arg(args, &mut i)?
                    .parse()
                    .map_err(|_| "invalid pool size".to_string())?;
            }
            "--help" | "-h" => return Err(String::new()),
            other => return Err(format!("unknown option '{}'", other)),
        }
        i += 1;
    }

    Ok(opts)
}

fn build_engine(opts: &Options) -> Result<Engine> {
    let mut config = EngineConfig {
        pool_size: opts.pool_size,
        ..Default::default()
    };
    if let Some(cores) = &opts.cores {
        config.worker_cores = cores.clone();
    }

    let ports: Vec<Arc<dyn BurstPort>> = if opts.loopback || opts.ports.is_empty() {
        log::info!("no interfaces given, running on an in-memory loopback port");
        config.rx_ports = vec![0];
        config.link_mbps = 10_000.0;
        vec![Arc::new(LoopbackPort::new(8192, config.link_mbps))]
    } else {
        let mut ports: Vec<Arc<dyn BurstPort>> = Vec::new();
        for (name, mbps) in &opts.ports {
            let rx_pool = MbufPool::new(format!("rx_{}", name), opts.pool_size, 2048, 0)?;
            ports.push(Arc::new(PcapPort::open(name, rx_pool, *mbps)?));
        }
        // Dual-port layout: transmit on port 0, receive on port 1
        if ports.len() >= 2 {
            config.rx_ports = vec![1];
        }
        config.link_mbps = opts
            .ports
            .iter()
            .map(|(_, mbps)| *mbps)
            .fold(f64::INFINITY, f64::min);
        ports
    };

    Engine::new(config, ports)
}

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    let opts = match parse_args(&args) {
        Ok(opts) => opts,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {}", msg);
            }
            usage(&args[0]);
            std::process::exit(if msg.is_empty() { 0 } else { 2 });
        }
    };

    let handler = handle_signal as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }

    let mut engine = match build_engine(&opts) {
        Ok(engine) => engine,
        Err(e) => {
            log::error!("initialization failed: {}", e);
            std::process::exit(1);
        }
    };

    let server = match ControlServer::bind(&opts.socket_path) {
        Ok(server) => server,
        Err(e) => {
            log::error!("control socket setup failed: {}", e);
            std::process::exit(1);
        }
    };

    log::info!("engine up, awaiting control commands");
    if let Err(e) = server.run(&mut engine, &SHUTDOWN) {
        log::error!("control loop failed: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = engine.stop() {
        log::warn!("shutdown stop failed: {}", e);
    }
    log::info!("clean shutdown");
}
