use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{Value, json};
use uuid::Uuid;

use super::socket::SeqPacketSocket;
use super::{METRICS, ProtocolStage, SamplingPlan, TelemetryCsvWriter, protocol_error};
use crate::error::Result;

/// Size of the registration reply buffer, before the server has told us
/// its real maximum.
pub const INITIAL_READ_LEN: usize = 1024;

/// How long a fresh connection waits for the endpoint's greeting.
pub const GREETING_WAIT: Duration = Duration::from_millis(500);

const XSTATS_COMMAND: &str = "/ethdev/xstats";

fn max_output_len_of(message: &Value) -> Option<usize> {
    message
        .get("max_output_len")
        .and_then(Value::as_u64)
        .and_then(|n| usize::try_from(n).ok())
        .filter(|&n| n > 0)
}

/// Callback path unique to this client instance.
pub fn unique_client_path() -> String {
    format!("/tmp/doat-telemetry-{}", Uuid::new_v4())
}

/// One registered connection to a telemetry endpoint.
///
/// Dropping the session unregisters it, so a sampling loop that bails out
/// with `?` still releases the server-side registration.
pub struct TelemetrySession {
    socket: SeqPacketSocket,
    client_path: String,
    max_output_len: usize,
    samples: u64,
    registered: bool,
}

impl TelemetrySession {
    /// Connect to `path` and register.
    pub fn connect(path: &Path, read_timeout: Option<Duration>) -> Result<Self> {
        let socket = SeqPacketSocket::connect(path).map_err(|e| {
            protocol_error(ProtocolStage::Connect, format!("{}: {e}", path.display()))
        })?;
        socket
            .set_read_timeout(read_timeout)
            .map_err(|e| protocol_error(ProtocolStage::Connect, e))?;
        Self::handshake(socket, unique_client_path())
    }

    /// Register `client_path` over an already connected socket.
    ///
    /// A v2 endpoint greets every new connection with
    /// `{version, pid, max_output_len}` and answers every message after
    /// that, the registration included. Both replies are consumed here so
    /// the first xstats request reads its own reply. An endpoint that does
    /// not greet must report `max_output_len` in the registration reply.
    pub fn handshake(socket: SeqPacketSocket, client_path: String) -> Result<Self> {
        let mut greeting_len = None;
        let greeted = socket
            .wait_readable(GREETING_WAIT)
            .map_err(|e| protocol_error(ProtocolStage::Connect, e))?;
        if greeted {
            let greeting = socket
                .recv(INITIAL_READ_LEN)
                .map_err(|e| protocol_error(ProtocolStage::Connect, e))?;
            let greeting: Value = serde_json::from_slice(&greeting).map_err(|e| {
                protocol_error(ProtocolStage::Connect, format!("invalid greeting: {e}"))
            })?;
            greeting_len = max_output_len_of(&greeting);
            log::debug!("telemetry endpoint greeting: {greeting}");
        }

        let request = json!({
            "action": 1,
            "command": "clients",
            "data": { "client_path": client_path },
        });
        socket
            .send(request.to_string().as_bytes())
            .map_err(|e| protocol_error(ProtocolStage::Register, e))?;
        let reply = socket
            .recv(greeting_len.unwrap_or(INITIAL_READ_LEN))
            .map_err(|e| protocol_error(ProtocolStage::Register, e))?;
        let reply_len = serde_json::from_slice::<Value>(&reply)
            .ok()
            .as_ref()
            .and_then(max_output_len_of);
        let max_output_len = reply_len.or(greeting_len).ok_or_else(|| {
            protocol_error(ProtocolStage::Register, "endpoint never reported max_output_len")
        })?;

        log::debug!("registered {client_path}, max_output_len {max_output_len}");
        Ok(Self {
            socket,
            client_path,
            max_output_len,
            samples: 0,
            registered: true,
        })
    }

    pub fn max_output_len(&self) -> usize {
        self.max_output_len
    }

    pub fn client_path(&self) -> &str {
        &self.client_path
    }

    /// Samples read so far on this connection.
    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// Read the extended stats of `port`, returned in [`METRICS`] order.
    pub fn read_xstats(&mut self, port: u16) -> Result<Vec<u64>> {
        let request = format!("{XSTATS_COMMAND},{port}");
        self.socket
            .send(request.as_bytes())
            .map_err(|e| protocol_error(ProtocolStage::Request, e))?;
        let reply = self
            .socket
            .recv(self.max_output_len)
            .map_err(|e| protocol_error(ProtocolStage::Reply, e))?;
        let reply: Value = serde_json::from_slice(&reply)
            .map_err(|e| protocol_error(ProtocolStage::Parse, format!("invalid reply: {e}")))?;
        let counters = reply
            .get(XSTATS_COMMAND)
            .and_then(Value::as_object)
            .ok_or_else(|| {
                protocol_error(ProtocolStage::Parse, format!("reply has no {XSTATS_COMMAND} map"))
            })?;

        let values = METRICS
            .iter()
            .map(|&metric| {
                counters
                    .get(metric)
                    .and_then(Value::as_u64)
                    .ok_or_else(|| {
                        protocol_error(
                            ProtocolStage::Parse,
                            format!("port {port} reply has no counter {metric}"),
                        )
                    })
            })
            .collect::<Result<Vec<u64>>>()?;
        self.samples += 1;
        Ok(values)
    }

    /// Sample according to `plan`, appending one row per sample.
    pub fn sample_into<W: Write>(
        &mut self,
        plan: &SamplingPlan,
        writer: &mut TelemetryCsvWriter<W>,
        sleep: &mut dyn FnMut(Duration),
    ) -> Result<u64> {
        let last = plan.last_tick();
        for tick in 0..=last {
            let values = self.read_xstats(plan.port)?;
            writer.write_row(plan.elapsed_at(tick), &values)?;
            if tick < last {
                sleep(plan.step);
            }
        }
        Ok(last + 1)
    }

    /// Unregister and close.
    pub fn close(mut self) -> Result<()> {
        self.unregister()
    }

    fn unregister(&mut self) -> Result<()> {
        if !self.registered {
            return Ok(());
        }
        self.registered = false;
        let request = json!({
            "action": 2,
            "command": "clients",
            "data": { "client_path": self.client_path },
        });
        self.socket
            .send(request.to_string().as_bytes())
            .map_err(|e| protocol_error(ProtocolStage::Unregister, e))?;
        log::debug!("unregistered {}", self.client_path);
        Ok(())
    }
}

impl Drop for TelemetrySession {
    fn drop(&mut self) {
        if let Err(e) = self.unregister() {
            log::warn!("telemetry unregistration failed: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// Collector entry point
// ---------------------------------------------------------------------------

/// Everything the `telemetry-client` collector process needs.
#[derive(Debug, Clone)]
pub struct CollectorOptions {
    pub plan: SamplingPlan,
    pub csv_path: PathBuf,
    pub sockets: Vec<PathBuf>,
    pub read_timeout: Option<Duration>,
}

/// Sample every socket in turn into one CSV file. Sockets that refuse the
/// connection or the handshake are skipped; a malformed reply stops the
/// collector with an error after the session has been unregistered.
pub fn run_collector(options: &CollectorOptions) -> Result<u64> {
    let mut writer = TelemetryCsvWriter::create(&options.csv_path)?;
    if options.sockets.is_empty() {
        log::warn!("no DPDK telemetry sockets found");
    }

    for path in &options.sockets {
        let mut session = match TelemetrySession::connect(path, options.read_timeout) {
            Ok(session) => session,
            Err(e) => {
                log::warn!("skipping telemetry socket {}: {e}", path.display());
                continue;
            }
        };
        log::info!(
            "sampling {} (port {}, {} samples)",
            path.display(),
            options.plan.port,
            options.plan.sample_count()
        );
        session.sample_into(&options.plan, &mut writer, &mut std::thread::sleep)?;
        session.close()?;
    }
    Ok(writer.rows())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::JoinHandle;

    fn xstats_reply(base: u64) -> String {
        let counters: serde_json::Map<String, Value> = METRICS
            .iter()
            .enumerate()
            .map(|(i, m)| (m.to_string(), json!(base + i as u64)))
            .collect();
        json!({ XSTATS_COMMAND: counters }).to_string()
    }

    /// Behaves like a v2 endpoint: greets on connect, answers the
    /// registration as an unknown command, answers `replies` requests,
    /// then records the unregistration message. Returns every message it
    /// received.
    fn fake_server(server: SeqPacketSocket, replies: Vec<String>) -> JoinHandle<Vec<String>> {
        std::thread::spawn(move || {
            let mut seen = Vec::new();
            server
                .send(json!({"version": "DPDK 23.11", "pid": 1, "max_output_len": 16384}).to_string().as_bytes())
                .unwrap();
            let hello = String::from_utf8(server.recv(4096).unwrap()).unwrap();
            let mut unknown = serde_json::Map::new();
            unknown.insert(hello.clone(), Value::Null);
            server.send(Value::Object(unknown).to_string().as_bytes()).unwrap();
            seen.push(hello);
            for reply in replies {
                let request = server.recv(4096).unwrap();
                seen.push(String::from_utf8(request).unwrap());
                server.send(reply.as_bytes()).unwrap();
            }
            if let Ok(last) = server.recv(4096) {
                seen.push(String::from_utf8(last).unwrap());
            }
            seen
        })
    }

    #[test]
    fn test_handshake_reads_max_output_len() {
        let (client, server) = SeqPacketSocket::pair().unwrap();
        let handle = fake_server(server, vec![]);
        let session = TelemetrySession::handshake(client, "/tmp/doat-test".into()).unwrap();
        assert_eq!(session.max_output_len(), 16384);
        session.close().unwrap();

        let seen = handle.join().unwrap();
        let register: Value = serde_json::from_str(&seen[0]).unwrap();
        assert_eq!(register["action"], 1);
        assert_eq!(register["command"], "clients");
        assert_eq!(register["data"]["client_path"], "/tmp/doat-test");
        let unregister: Value = serde_json::from_str(&seen[1]).unwrap();
        assert_eq!(unregister["action"], 2);
    }

    #[test]
    fn test_greeting_endpoint_stays_in_step() {
        let (client, server) = SeqPacketSocket::pair().unwrap();
        let handle = fake_server(server, vec![xstats_reply(7), xstats_reply(70)]);
        let mut session = TelemetrySession::handshake(client, "/tmp/doat-test".into()).unwrap();
        assert_eq!(session.read_xstats(0).unwrap()[0], 7);
        assert_eq!(session.read_xstats(0).unwrap()[0], 70);
        session.close().unwrap();

        let seen = handle.join().unwrap();
        assert_eq!(&seen[1..3], ["/ethdev/xstats,0", "/ethdev/xstats,0"]);
    }

    #[test]
    fn test_silent_endpoint_reports_len_on_registration() {
        let (client, server) = SeqPacketSocket::pair().unwrap();
        let handle = std::thread::spawn(move || {
            server.recv(4096).unwrap();
            server.send(br#"{"max_output_len": 2048}"#).unwrap();
            server.recv(4096).unwrap();
            server.send(xstats_reply(5).as_bytes()).unwrap();
            let _ = server.recv(4096);
        });
        let mut session = TelemetrySession::handshake(client, "/tmp/doat-test".into()).unwrap();
        assert_eq!(session.max_output_len(), 2048);
        assert_eq!(session.read_xstats(1).unwrap()[0], 5);
        drop(session);
        handle.join().unwrap();
    }

    #[test]
    fn test_handshake_without_max_output_len_fails() {
        let (client, server) = SeqPacketSocket::pair().unwrap();
        let handle = std::thread::spawn(move || {
            server.recv(4096).unwrap();
            server.send(br#"{"version": "DPDK"}"#).unwrap();
        });
        let err = TelemetrySession::handshake(client, "/tmp/x".into()).err().unwrap();
        assert!(matches!(
            err,
            crate::DoatError::Protocol {
                stage: ProtocolStage::Register,
                ..
            }
        ));
        handle.join().unwrap();
    }

    #[test]
    fn test_sampling_writes_boundary_inclusive_rows() {
        let (client, server) = SeqPacketSocket::pair().unwrap();
        let replies = (0..3).map(|i| xstats_reply(i * 100)).collect();
        let handle = fake_server(server, replies);

        let mut session = TelemetrySession::handshake(client, "/tmp/doat-test".into()).unwrap();
        let plan = SamplingPlan::new(Duration::from_secs(2), Duration::from_secs(1), 3).unwrap();
        let mut writer = TelemetryCsvWriter::new(Vec::new()).unwrap();
        let mut sleeps = Vec::new();
        let rows = session
            .sample_into(&plan, &mut writer, &mut |d| sleeps.push(d))
            .unwrap();
        assert_eq!(rows, 3);
        assert_eq!(session.samples(), 3);
        assert_eq!(sleeps, vec![Duration::from_secs(1); 2]);
        session.close().unwrap();

        let seen = handle.join().unwrap();
        assert_eq!(seen[1], "/ethdev/xstats,3");
        let text = String::from_utf8(writer.into_inner().unwrap()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[1].starts_with("0,0,1,2,"));
        assert!(lines[3].starts_with("2,200,201,"));
    }

    #[test]
    fn test_malformed_reply_still_unregisters() {
        let (client, server) = SeqPacketSocket::pair().unwrap();
        let handle = fake_server(server, vec![xstats_reply(0), "not json".to_string()]);

        let mut session = TelemetrySession::handshake(client, "/tmp/doat-test".into()).unwrap();
        let plan = SamplingPlan::new(Duration::from_secs(5), Duration::from_secs(1), 0).unwrap();
        let mut writer = TelemetryCsvWriter::new(Vec::new()).unwrap();
        let err = session
            .sample_into(&plan, &mut writer, &mut |_| {})
            .unwrap_err();
        assert!(matches!(
            err,
            crate::DoatError::Protocol {
                stage: ProtocolStage::Parse,
                ..
            }
        ));
        assert_eq!(writer.rows(), 1);
        drop(session);

        let seen = handle.join().unwrap();
        let unregister: Value = serde_json::from_str(seen.last().unwrap()).unwrap();
        assert_eq!(unregister["action"], 2);
    }

    #[test]
    fn test_missing_counter_is_parse_error() {
        let (client, server) = SeqPacketSocket::pair().unwrap();
        let reply = json!({ XSTATS_COMMAND: { "tx_good_packets": 1 } }).to_string();
        let handle = fake_server(server, vec![reply]);
        let mut session = TelemetrySession::handshake(client, "/tmp/doat-test".into()).unwrap();
        let err = session.read_xstats(0).unwrap_err();
        assert!(err.to_string().contains("tx_good_bytes"));
        drop(session);
        handle.join().unwrap();
    }

    #[test]
    fn test_collector_skips_unreachable_sockets() {
        let tmp = tempfile::tempdir().unwrap();
        let csv_path = tmp.path().join("telemetry.csv");
        let options = CollectorOptions {
            plan: SamplingPlan::new(Duration::ZERO, Duration::from_secs(1), 0).unwrap(),
            csv_path: csv_path.clone(),
            sockets: vec![tmp.path().join("missing/dpdk_telemetry.v2")],
            read_timeout: Some(Duration::from_millis(100)),
        };
        assert_eq!(run_collector(&options).unwrap(), 0);
        let text = std::fs::read_to_string(csv_path).unwrap();
        assert_eq!(text.lines().count(), 1);
    }
}
