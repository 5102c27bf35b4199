//! JSON control channel
//!
//! A Unix-domain stream socket carrying one newline-terminated JSON request
//! per connection and returning one newline-terminated JSON response.
//! Command dispatch owns the engine state transitions; malformed requests
//! and invalid configurations are rejected synchronously without touching
//! engine state.

use crate::impair::ImpairmentConfig;
use crate::pattern::RatePattern;
use crate::profile::{
    L2Template, L3Endpoints, L4Proto, MplsLabel, PayloadKind, ProfileCounters, QinqTags,
    TrafficProfile, VlanTag, VxlanOuter,
};
use crate::rfc2544;
use crate::{Engine, Error, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Default control socket path
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/dpdk_engine_control.sock";

/// Incoming request shape
#[derive(Debug, Deserialize)]
struct Request {
    command: String,
    #[serde(default)]
    params: Option<Value>,
}

/// Control-plane profile description, mapped onto a `TrafficProfile`
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ProfileDesc {
    pub name: String,
    pub stream_id: Option<u16>,
    pub port: usize,
    pub dst_ip: String,
    pub src_ip: Option<String>,
    pub dst_port: u16,
    pub src_port_min: u16,
    pub src_port_max: u16,
    /// One of udp, tcp, icmp, dns, http
    pub protocol: String,
    pub frame_size: u16,
    pub rate_mbps: f64,
    pub pattern: Option<RatePattern>,
    pub burst_size: u32,
    pub dscp: u8,
    pub vlan: Option<VlanTag>,
    pub qinq: Option<QinqTags>,
    pub mpls: Vec<MplsLabel>,
    pub vxlan_vni: Option<u32>,
    pub payload: Option<PayloadKind>,
    pub dns_query: String,
    pub http_method: String,
    pub http_uri: String,
    pub http_host: String,
    pub impairment: Option<ImpairmentConfig>,
}

impl Default for ProfileDesc {
    fn default() -> Self {
        Self {
            name: "udp-default".to_string(),
            stream_id: None,
            port: 0,
            dst_ip: "192.168.1.2".to_string(),
            src_ip: None,
            dst_port: 5000,
            src_port_min: 10_000,
            src_port_max: 20_000,
            protocol: "udp".to_string(),
            frame_size: 1024,
            rate_mbps: 100.0,
            pattern: None,
            burst_size: 1,
            dscp: 0,
            vlan: None,
            qinq: None,
            mpls: Vec::new(),
            vxlan_vni: None,
            payload: None,
            dns_query: "example.com".to_string(),
            http_method: "GET".to_string(),
            http_uri: "/".to_string(),
            http_host: "example.com".to_string(),
            impairment: None,
        }
    }
}

impl ProfileDesc {
    /// Resolve the description into a validated-shape profile; full
    /// validation happens when the store installs it.
    pub fn build(self, index: usize) -> Result<TrafficProfile> {
        let ports = (self.src_port_min, self.src_port_max, self.dst_port);
        let l4 = match self.protocol.as_str() {
            "udp" => L4Proto::Udp {
                src_port_min: ports.0,
                src_port_max: ports.1,
                dst_port: ports.2,
            },
            "tcp" => L4Proto::TcpSyn {
                src_port_min: ports.0,
                src_port_max: ports.1,
                dst_port: ports.2,
            },
            "icmp" => L4Proto::IcmpEcho,
            "dns" => L4Proto::DnsQuery {
                src_port_min: ports.0,
                src_port_max: ports.1,
                dst_port: ports.2,
                domain: self.dns_query.clone(),
            },
            "http" => L4Proto::HttpRequest {
                src_port_min: ports.0,
                src_port_max: ports.1,
                dst_port: ports.2,
                method: self.http_method.clone(),
                uri: self.http_uri.clone(),
                host: self.http_host.clone(),
            },
            other => {
                return Err(Error::InvalidConfig(format!(
                    "unknown protocol '{}'",
                    other
                )))
            }
        };

        let l3 = if let Ok(dst) = self.dst_ip.parse::<std::net::Ipv6Addr>() {
            let src = match &self.src_ip {
                Some(s) => s
                    .parse()
                    .map_err(|_| Error::InvalidConfig(format!("invalid src_ip '{}'", s)))?,
                None => "2001:db8::1".parse().unwrap(),
            };
            L3Endpoints::Ipv6 {
                src,
                dst,
                dscp: self.dscp,
            }
        } else {
            let dst = self.dst_ip.parse().map_err(|_| {
                Error::InvalidConfig(format!("invalid dst_ip '{}'", self.dst_ip))
            })?;
            let src = match &self.src_ip {
                Some(s) => s
                    .parse()
                    .map_err(|_| Error::InvalidConfig(format!("invalid src_ip '{}'", s)))?,
                None => "192.168.1.1".parse().unwrap(),
            };
            L3Endpoints::Ipv4 {
                src,
                dst,
                dscp: self.dscp,
            }
        };

        Ok(TrafficProfile {
            name: self.name,
            stream_id: self.stream_id.unwrap_or(index as u16),
            worker: 0,
            port: self.port,
            l2: L2Template {
                vlan: self.vlan,
                qinq: self.qinq,
                mpls: self.mpls,
                ..L2Template::default()
            },
            l3,
            vxlan: self.vxlan_vni.map(|vni| VxlanOuter { vni }),
            l4,
            payload: self.payload.unwrap_or_default(),
            frame_size: self.frame_size,
            rate_mbps: self.rate_mbps,
            pattern: self.pattern,
            burst_size: self.burst_size,
            impairment: self.impairment.unwrap_or_default(),
            counters: std::sync::Arc::new(ProfileCounters::default()),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct StartParams {
    profiles: Option<Vec<ProfileDesc>>,
}

impl Default for StartParams {
    fn default() -> Self {
        Self { profiles: None }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct ThroughputParams {
    duration: u64,
    frame_size: u16,
    loss_threshold: f64,
}

impl Default for ThroughputParams {
    fn default() -> Self {
        Self {
            duration: 60,
            frame_size: 1518,
            loss_threshold: 0.01,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct LatencyParams {
    rate_mbps: f64,
    duration: u64,
    frame_size: u16,
}

impl Default for LatencyParams {
    fn default() -> Self {
        Self {
            rate_mbps: 100.0,
            duration: 10,
            frame_size: 1518,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct MultiSizeParams {
    frame_sizes: Vec<u16>,
    duration: u64,
    loss_threshold: f64,
}

impl Default for MultiSizeParams {
    fn default() -> Self {
        Self {
            frame_sizes: vec![64, 128, 256, 512, 1024, 1518],
            duration: 10,
            loss_threshold: 0.01,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct BidirectionalParams {
    rate_mbps: f64,
    duration: u64,
    frame_size: u16,
}

impl Default for BidirectionalParams {
    fn default() -> Self {
        Self {
            rate_mbps: 100.0,
            duration: 10,
            frame_size: 1518,
        }
    }
}

fn success(data: Value) -> String {
    json!({"status": "success", "data": data}).to_string()
}

fn success_message(message: &str) -> String {
    json!({"status": "success", "message": message}).to_string()
}

fn error_response(message: &str) -> String {
    json!({"status": "error", "message": message}).to_string()
}

fn parse_params<T: for<'de> Deserialize<'de> + Default>(params: Option<Value>) -> Result<T> {
    match params {
        Some(value) => serde_json::from_value(value)
            .map_err(|e| Error::Protocol(format!("invalid params: {}", e))),
        None => Ok(T::default()),
    }
}

/// Dispatch one request line and produce the response body
pub fn dispatch(engine: &mut Engine, line: &str) -> String {
    let request: Request = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(_) => return error_response("Invalid JSON"),
    };

    let result = match request.command.as_str() {
        "configure" => cmd_configure(engine, request.params),
        "start" => cmd_start(engine, request.params),
        "stop" => engine.stop().map(|_| success_message("Stopped")),
        "stats" => Ok(cmd_stats(engine)),
        "rfc2544_throughput" => cmd_throughput(engine, request.params),
        "rfc2544_latency" => cmd_latency(engine, request.params),
        "rfc2544_multi_size" => cmd_multi_size(engine, request.params),
        "rfc2544_bidirectional" => cmd_bidirectional(engine, request.params),
        _ => Err(Error::Protocol("Unknown command".to_string())),
    };

    match result {
        Ok(response) => response,
        Err(e) => error_response(&e.to_string()),
    }
}

fn cmd_configure(engine: &mut Engine, params: Option<Value>) -> Result<String> {
    let params: StartParams = parse_params(params)?;
    let descs = params
        .profiles
        .ok_or_else(|| Error::Protocol("configure requires a profile array".to_string()))?;

    let mut profiles = Vec::with_capacity(descs.len());
    for (i, desc) in descs.into_iter().enumerate() {
        profiles.push(desc.build(i)?);
    }
    let count = profiles.len();
    engine.configure(profiles)?;
    Ok(success(json!({ "profiles": count })))
}

fn cmd_start(engine: &mut Engine, params: Option<Value>) -> Result<String> {
    let params: StartParams = parse_params(params)?;

    match params.profiles {
        Some(descs) => {
            let mut profiles = Vec::with_capacity(descs.len());
            for (i, desc) in descs.into_iter().enumerate() {
                profiles.push(desc.build(i)?);
            }
            engine.configure(profiles)?;
        }
        None => {
            if !engine.has_profiles() {
                engine.configure(vec![ProfileDesc::default().build(0)?])?;
            }
        }
    }

    engine.start()?;
    Ok(success_message("Started"))
}

fn cmd_stats(engine: &Engine) -> String {
    let stats = engine.stats();
    let workers: Vec<Value> = stats
        .workers
        .iter()
        .map(|w| {
            json!({
                "core": w.core,
                "numa_node": w.numa_node,
                "role": w.role,
                "packets_processed": w.packets_processed,
                "bytes_processed": w.bytes_processed,
                "cycles_processed": w.cycles_processed,
            })
        })
        .collect();

    success(json!({
        "state": stats.state.to_string(),
        "packets_sent": stats.tx.packets_sent,
        "bytes_sent": stats.tx.bytes_sent,
        "packets_dropped": stats.tx.packets_dropped,
        "packets_duplicated": stats.tx.packets_duplicated,
        "packets_received": stats.rx.packets_received,
        "bytes_received": stats.rx.bytes_received,
        "lost_packets": stats.rx.lost_packets,
        "out_of_order": stats.rx.out_of_order,
        "duplicates": stats.rx.duplicates,
        "late_arrivals": stats.rx.late_arrivals,
        "min_latency_ns": stats.rx.min_latency_ns,
        "max_latency_ns": stats.rx.max_latency_ns,
        "avg_latency_ns": stats.rx.avg_latency_ns,
        "jitter_ns": stats.rx.jitter_ns,
        "latency_samples": stats.rx.latency_samples,
        "workers": workers,
    }))
}

fn cmd_throughput(engine: &mut Engine, params: Option<Value>) -> Result<String> {
    let params: ThroughputParams = parse_params(params)?;
    let config = rfc2544::ThroughputConfig {
        duration: Duration::from_secs(params.duration),
        frame_size: params.frame_size,
        loss_threshold_pct: params.loss_threshold,
    };
    let result = rfc2544::run_throughput(engine, &config)?;
    Ok(success(json!({
        "max_rate_mbps": result.max_rate_mbps,
        "max_rate_fps": result.max_rate_fps,
        "frame_size": result.frame_size,
        "iterations": result.iterations,
    })))
}

fn cmd_latency(engine: &mut Engine, params: Option<Value>) -> Result<String> {
    let params: LatencyParams = parse_params(params)?;
    let config = rfc2544::LatencyConfig {
        rate_mbps: params.rate_mbps,
        duration: Duration::from_secs(params.duration),
        frame_size: params.frame_size,
    };
    let result = rfc2544::run_latency(engine, &config)?;
    Ok(success(json!({
        "min_latency_ns": result.min_latency_ns,
        "avg_latency_ns": result.avg_latency_ns,
        "max_latency_ns": result.max_latency_ns,
        "jitter_ns": result.jitter_ns,
        "samples": result.samples,
    })))
}

fn cmd_multi_size(engine: &mut Engine, params: Option<Value>) -> Result<String> {
    let params: MultiSizeParams = parse_params(params)?;
    let results = rfc2544::run_multi_size(
        engine,
        &params.frame_sizes,
        Duration::from_secs(params.duration),
        params.loss_threshold,
    )?;
    let rows: Vec<Value> = results
        .iter()
        .map(|r| {
            json!({
                "frame_size": r.frame_size,
                "max_rate_mbps": r.max_rate_mbps,
                "max_rate_fps": r.max_rate_fps,
                "iterations": r.iterations,
            })
        })
        .collect();
    Ok(success(json!({ "results": rows })))
}

fn cmd_bidirectional(engine: &mut Engine, params: Option<Value>) -> Result<String> {
    let params: BidirectionalParams = parse_params(params)?;
    let result = rfc2544::run_bidirectional(
        engine,
        params.rate_mbps,
        params.frame_size,
        Duration::from_secs(params.duration),
    )?;
    Ok(success(json!({
        "tx_packets": result.tx_packets,
        "rx_packets": result.rx_packets,
        "loss_pct": result.loss_pct,
        "avg_latency_ns": result.avg_latency_ns,
    })))
}

/// Unix-socket control server; one request/response per connection
pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
}

impl ControlServer {
    /// Bind the socket, replacing any stale file at the path
    pub fn bind<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).map_err(Error::IoError)?;
        listener.set_nonblocking(true).map_err(Error::IoError)?;
        log::info!("control socket listening on {}", path.display());
        Ok(Self { listener, path })
    }

    /// Accept loop; returns when `shutdown` is raised
    pub fn run(&self, engine: &mut Engine, shutdown: &AtomicBool) -> Result<()> {
        while !shutdown.load(Ordering::Relaxed) {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    if let Err(e) = handle_client(stream, engine) {
                        log::warn!("control client error: {}", e);
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    log::warn!("control accept error: {}", e);
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        }
        Ok(())
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn handle_client(stream: UnixStream, engine: &mut Engine) -> Result<()> {
    stream.set_nonblocking(false).map_err(Error::IoError)?;
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .map_err(Error::IoError)?;

    let mut reader = BufReader::new(&stream);
    let mut line = String::new();
    reader.read_line(&mut line).map_err(Error::IoError)?;

    let response = dispatch(engine, line.trim());
    let mut writer = &stream;
    writer
        .write_all(response.as_bytes())
        .and_then(|_| writer.write_all(b"\n"))
        .map_err(Error::IoError)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::{BurstPort, LoopbackPort};
    use crate::{EngineConfig, EngineState};
    use std::sync::Arc;

    fn engine() -> Engine {
        let port: Arc<dyn BurstPort> = Arc::new(LoopbackPort::new(4096, 1_000.0));
        let config = EngineConfig {
            pool_size: 1024,
            worker_cores: vec![0, 1],
            rx_ports: vec![0],
            link_mbps: 1_000.0,
            ..Default::default()
        };
        Engine::new(config, vec![port]).unwrap()
    }

    fn parse(response: &str) -> Value {
        serde_json::from_str(response).unwrap()
    }

    #[test]
    fn test_start_stop_round_trip() {
        let mut eng = engine();

        let response = parse(&dispatch(&mut eng, r#"{"command":"start"}"#));
        assert_eq!(response["status"], "success");
        assert_eq!(eng.state(), EngineState::Running);

        let response = parse(&dispatch(&mut eng, r#"{"command":"stop"}"#));
        assert_eq!(response["status"], "success");
        assert_eq!(response["message"], "Stopped");
        assert_eq!(eng.state(), EngineState::Idle);
    }

    #[test]
    fn test_start_with_profile_array() {
        let mut eng = engine();
        let request = r#"{"command":"start","params":{"profiles":[
            {"name":"a","dst_ip":"10.0.0.2","dst_port":7000,"frame_size":512,"rate_mbps":50.0,
             "pattern":{"type":"constant","rate":50.0}},
            {"name":"b","dst_ip":"10.0.0.3","protocol":"tcp","frame_size":256,"rate_mbps":25.0}
        ]}}"#;
        let response = parse(&dispatch(&mut eng, &request.replace('\n', "")));
        assert_eq!(response["status"], "success", "{}", response);
        dispatch(&mut eng, r#"{"command":"stop"}"#);
    }

    #[test]
    fn test_invalid_profile_rejected_without_state_change() {
        let mut eng = engine();
        // Frame too small for the header stack
        let request = r#"{"command":"start","params":{"profiles":[
            {"name":"tiny","dst_ip":"10.0.0.2","frame_size":40,"rate_mbps":10.0}
        ]}}"#;
        let response = parse(&dispatch(&mut eng, &request.replace('\n', "")));
        assert_eq!(response["status"], "error");
        assert_eq!(eng.state(), EngineState::Idle);
        assert!(!eng.has_profiles());
    }

    #[test]
    fn test_configure_then_bare_start() {
        let mut eng = engine();
        let request = r#"{"command":"configure","params":{"profiles":[
            {"name":"pre","dst_ip":"10.0.0.9","frame_size":512,"rate_mbps":40.0}
        ]}}"#;
        let response = parse(&dispatch(&mut eng, &request.replace('\n', "")));
        assert_eq!(response["status"], "success", "{}", response);
        assert!(eng.has_profiles());

        // A bare start must run the configured set, not the default profile
        let response = parse(&dispatch(&mut eng, r#"{"command":"start"}"#));
        assert_eq!(response["status"], "success");
        dispatch(&mut eng, r#"{"command":"stop"}"#);

        // Reconfiguring while running is rejected
        dispatch(&mut eng, r#"{"command":"start"}"#);
        let response = parse(&dispatch(&mut eng, &request.replace('\n', "")));
        assert_eq!(response["status"], "error");
        dispatch(&mut eng, r#"{"command":"stop"}"#);
    }

    #[test]
    fn test_malformed_json() {
        let mut eng = engine();
        let response = parse(&dispatch(&mut eng, "{not json"));
        assert_eq!(response["status"], "error");
        assert_eq!(response["message"], "Invalid JSON");
    }

    #[test]
    fn test_unknown_command() {
        let mut eng = engine();
        let response = parse(&dispatch(&mut eng, r#"{"command":"reboot"}"#));
        assert_eq!(response["status"], "error");
    }

    #[test]
    fn test_stats_shape() {
        let mut eng = engine();
        dispatch(&mut eng, r#"{"command":"start"}"#);
        std::thread::sleep(Duration::from_millis(100));
        let response = parse(&dispatch(&mut eng, r#"{"command":"stats"}"#));
        dispatch(&mut eng, r#"{"command":"stop"}"#);

        assert_eq!(response["status"], "success");
        let data = &response["data"];
        assert_eq!(data["state"], "running");
        assert!(data["packets_sent"].as_u64().unwrap() > 0);
        assert!(data["packets_received"].is_u64());
        assert!(data["lost_packets"].is_u64());
        assert!(data["avg_latency_ns"].is_u64());
        assert!(data["workers"].as_array().unwrap().len() == 2);
    }

    #[test]
    fn test_rfc2544_latency_command() {
        let mut eng = engine();
        let request =
            r#"{"command":"rfc2544_latency","params":{"rate_mbps":30.0,"duration":1,"frame_size":512}}"#;
        let response = parse(&dispatch(&mut eng, request));
        assert_eq!(response["status"], "success", "{}", response);
        let data = &response["data"];
        assert!(data["samples"].as_u64().unwrap() > 0);
        assert!(data["max_latency_ns"].as_u64().unwrap() >= data["min_latency_ns"].as_u64().unwrap());
    }

    #[test]
    fn test_profile_desc_defaults() {
        let desc = ProfileDesc::default();
        let prof = desc.build(0).unwrap();
        assert_eq!(prof.name, "udp-default");
        assert_eq!(prof.frame_size, 1024);
        assert!(prof.embeds_tag());
        assert!(prof.validate(1_000.0).is_ok());
    }

    #[test]
    fn test_profile_desc_ipv6() {
        let desc = ProfileDesc {
            dst_ip: "2001:db8::7".to_string(),
            ..Default::default()
        };
        let prof = desc.build(0).unwrap();
        assert!(matches!(prof.l3, L3Endpoints::Ipv6 { .. }));
    }

    #[test]
    fn test_profile_desc_bad_protocol() {
        let desc = ProfileDesc {
            protocol: "sctp".to_string(),
            ..Default::default()
        };
        assert!(desc.build(0).is_err());
    }

    #[test]
    fn test_socket_round_trip() {
        let path = std::env::temp_dir().join(format!("pktforge-ctl-{}.sock", std::process::id()));
        let server = ControlServer::bind(&path).unwrap();
        let shutdown = Arc::new(AtomicBool::new(false));

        let shutdown_thread = shutdown.clone();
        let server_thread = std::thread::spawn(move || {
            let mut eng = engine();
            server.run(&mut eng, &shutdown_thread).unwrap();
        });

        // Server polls at 50 ms; give it a beat to come up
        std::thread::sleep(Duration::from_millis(100));
        let stream = UnixStream::connect(&path).unwrap();
        let mut writer = &stream;
        writer.write_all(b"{\"command\":\"stats\"}\n").unwrap();

        let mut reader = BufReader::new(&stream);
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        let response: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(response["status"], "success");

        shutdown.store(true, Ordering::Relaxed);
        server_thread.join().unwrap();
    }
}
