//! OVSDB JSON-RPC client for the Open_vSwitch database.
//!
//! Every call opens its own connection. The transport is async (tokio) but
//! the client owns a current-thread runtime and exposes blocking methods, so
//! callers stay on the namespace-pinned thread.

use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio::runtime::Runtime;
use tracing::{debug, info};

use crate::error::OvsCniError;
use crate::vlan::VlanPolicy;

const DATABASE: &str = "Open_vSwitch";
const RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything written on a new container port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSpec {
    /// Host-side interface name; also the port name
    pub name: String,
    pub netns: String,
    pub container_iface: String,
    pub ovn_port: Option<String>,
    pub ofport_request: Option<u32>,
    pub vlan: VlanPolicy,
    pub interface_type: Option<String>,
    pub pod_uid: Option<String>,
}

/// VLAN columns of a live port.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortVlanState {
    pub mode: String,
    pub tag: Option<u16>,
    pub trunks: Vec<u16>,
}

/// Operations the plugin needs from the switch database.
pub trait SwitchDb {
    fn create_port(&self, bridge: &str, port: &PortSpec) -> Result<()>;

    fn delete_port(&self, bridge: &str, port_name: &str) -> Result<()>;

    /// Port carrying `external_ids` for this container interface, if any.
    fn find_port_for_container_iface(&self, container_iface: &str, netns: &str)
        -> Result<Option<String>>;

    /// Names of interfaces whose `error` column is set.
    fn interfaces_in_error(&self) -> Result<Vec<String>>;

    fn bridge_exists(&self, bridge: &str) -> Result<bool>;

    /// Bridge owning the port that holds interface `iface`.
    fn bridge_for_interface(&self, iface: &str) -> Result<String>;

    /// `link_state` of the interface backing `port_name`.
    fn port_link_state(&self, port_name: &str) -> Result<String>;

    fn port_vlan_state(&self, port_name: &str) -> Result<PortVlanState>;
}

/// Where the database listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(String),
    Tcp(String),
}

impl Endpoint {
    /// Parse `unix:<path>`, `tcp:<host>:<port>` or a bare socket path.
    pub fn parse(socket_file: &str) -> Result<Self, OvsCniError> {
        if let Some(path) = socket_file.strip_prefix("unix:") {
            Ok(Self::Unix(path.to_string()))
        } else if let Some(addr) = socket_file.strip_prefix("tcp:") {
            Ok(Self::Tcp(addr.to_string()))
        } else if socket_file.starts_with('/') {
            Ok(Self::Unix(socket_file.to_string()))
        } else {
            Err(OvsCniError::InvalidConfig(format!(
                "unsupported socket_file {:?}",
                socket_file
            )))
        }
    }
}

/// Direct OVSDB JSON-RPC client
pub struct OvsdbClient {
    endpoint: Endpoint,
    runtime: Runtime,
}

impl OvsdbClient {
    /// Create a client for `socket_file` (see [`Endpoint::parse`]).
    pub fn new(socket_file: &str) -> Result<Self> {
        let endpoint = Endpoint::parse(socket_file)?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to create Tokio runtime")?;
        Ok(Self { endpoint, runtime })
    }

    async fn rpc_call(&self, method: &str, params: Value) -> Result<Value> {
        debug!(endpoint = ?self.endpoint, method, "OVSDB request");
        let request = json!({ "method": method, "params": params, "id": 0 });
        let payload = serde_json::to_vec(&request)?;

        let response = tokio::time::timeout(RPC_TIMEOUT, async {
            match &self.endpoint {
                Endpoint::Unix(path) => {
                    let stream = UnixStream::connect(path)
                        .await
                        .with_context(|| format!("Failed to connect to OVSDB socket {}", path))?;
                    exchange(stream, &payload).await
                }
                Endpoint::Tcp(addr) => {
                    let stream = TcpStream::connect(addr)
                        .await
                        .with_context(|| format!("Failed to connect to OVSDB at {}", addr))?;
                    exchange(stream, &payload).await
                }
            }
        })
        .await
        .map_err(|_| OvsCniError::Ovsdb(format!("{} timed out after {:?}", method, RPC_TIMEOUT)))??;

        if let Some(error) = response.get("error").filter(|e| !e.is_null()) {
            return Err(OvsCniError::Ovsdb(error.to_string()).into());
        }
        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }

    /// Run a transaction and return the per-operation results.
    pub fn transact(&self, operations: Vec<Value>) -> Result<Vec<Value>> {
        let mut params = vec![json!(DATABASE)];
        params.extend(operations);
        let result = self
            .runtime
            .block_on(self.rpc_call("transact", Value::Array(params)))?;
        let results = match result {
            Value::Array(results) => results,
            other => return Err(OvsCniError::Ovsdb(format!("unexpected reply {}", other)).into()),
        };
        if let Some(failed) = results.iter().find(|r| r.get("error").is_some_and(|e| !e.is_null())) {
            return Err(OvsCniError::Ovsdb(format!(
                "{}: {}",
                failed["error"],
                failed.get("details").cloned().unwrap_or(Value::Null)
            ))
            .into());
        }
        Ok(results)
    }

    fn select(&self, table: &str, condition: Value, columns: &[&str]) -> Result<Vec<Value>> {
        let op = json!({
            "op": "select",
            "table": table,
            "where": condition,
            "columns": columns,
        });
        let mut results = self.transact(vec![op])?;
        Ok(rows(results.pop().unwrap_or(Value::Null)))
    }

    fn port_row(&self, port_name: &str, columns: &[&str]) -> Result<Value> {
        self.select("Port", json!([["name", "==", port_name]]), columns)?
            .into_iter()
            .next()
            .ok_or_else(|| OvsCniError::Ovsdb(format!("port {} not found", port_name)).into())
    }
}

async fn exchange<S>(mut stream: S, payload: &[u8]) -> Result<Value>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(payload).await?;
    stream.flush().await?;

    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(OvsCniError::Ovsdb("connection closed by server".into()).into());
        }
        buffer.extend_from_slice(&chunk[..n]);
        if let Some(reply) = next_reply(&buffer)? {
            return Ok(reply);
        }
    }
}

/// First complete JSON value in `buffer` that is a reply (not a server request).
fn next_reply(buffer: &[u8]) -> Result<Option<Value>> {
    let mut stream = serde_json::Deserializer::from_slice(buffer).into_iter::<Value>();
    loop {
        match stream.next() {
            Some(Ok(value)) => {
                if value.get("method").is_some_and(|m| !m.is_null()) {
                    continue;
                }
                return Ok(Some(value));
            }
            Some(Err(e)) if e.is_eof() => return Ok(None),
            Some(Err(e)) => return Err(e).context("Failed to parse OVSDB response"),
            None => return Ok(None),
        }
    }
}

/// Rows matched by a mutate or update operation.
fn mutated_rows(result: Option<&Value>) -> u64 {
    result
        .and_then(|r| r.get("count"))
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

fn rows(result: Value) -> Vec<Value> {
    match result.get("rows") {
        Some(Value::Array(rows)) => rows.clone(),
        _ => Vec::new(),
    }
}

/// Decode an OVSDB atom-or-set into its members.
///
/// `["set", [a, b]]` yields `[a, b]`, a bare atom yields `[atom]`.
fn set_members(value: &Value) -> Vec<Value> {
    match value.as_array() {
        Some(pair) if pair.len() == 2 && pair[0] == "set" => {
            pair[1].as_array().cloned().unwrap_or_default()
        }
        _ if value.is_null() => Vec::new(),
        _ => vec![value.clone()],
    }
}

fn uuid_of(value: &Value) -> Option<String> {
    match value.as_array() {
        Some(pair) if pair.len() == 2 && pair[0] == "uuid" => pair[1].as_str().map(String::from),
        _ => None,
    }
}

fn ovs_map(pairs: &[(&str, &str)]) -> Value {
    let entries: Vec<Value> = pairs.iter().map(|(k, v)| json!([k, v])).collect();
    json!(["map", entries])
}

fn ovs_set(values: Vec<Value>) -> Value {
    json!(["set", values])
}

/// Port and Interface rows plus the bridge mutation for a new container port.
pub fn create_port_operations(bridge: &str, port: &PortSpec) -> Vec<Value> {
    let iface_ref = "new_iface";
    let port_ref = "new_port";

    let mut iface_row = serde_json::Map::new();
    iface_row.insert("name".into(), json!(port.name));
    if let Some(kind) = port.interface_type.as_deref().filter(|t| !t.is_empty()) {
        iface_row.insert("type".into(), json!(kind));
    }
    if let Some(ofport) = port.ofport_request.filter(|p| *p > 0) {
        iface_row.insert("ofport_request".into(), json!(ofport));
    }
    if let Some(ovn_port) = port.ovn_port.as_deref() {
        iface_row.insert(
            "external_ids".into(),
            ovs_map(&[("iface-id", ovn_port), ("iface-status", "active")]),
        );
    }

    let mut external_ids = vec![
        ("contNetns", port.netns.as_str()),
        ("contIface", port.container_iface.as_str()),
        ("owner", "ovs-cni"),
    ];
    if let Some(uid) = port.pod_uid.as_deref() {
        external_ids.push(("contPodUid", uid));
    }

    let mut port_row = serde_json::Map::new();
    port_row.insert("name".into(), json!(port.name));
    port_row.insert("interfaces".into(), json!(["named-uuid", iface_ref]));
    port_row.insert("external_ids".into(), ovs_map(&external_ids));
    port_row.insert("vlan_mode".into(), json!(port.vlan.mode()));
    if let Some(tag) = port.vlan.tag() {
        port_row.insert("tag".into(), json!(tag));
    }
    if !port.vlan.trunks().is_empty() {
        let trunks = port.vlan.trunks().iter().map(|t| json!(t)).collect();
        port_row.insert("trunks".into(), ovs_set(trunks));
    }

    vec![
        json!({ "op": "insert", "table": "Interface", "row": iface_row, "uuid-name": iface_ref }),
        json!({ "op": "insert", "table": "Port", "row": port_row, "uuid-name": port_ref }),
        json!({
            "op": "mutate",
            "table": "Bridge",
            "where": [["name", "==", bridge]],
            "mutations": [["ports", "insert", ["set", [["named-uuid", port_ref]]]]]
        }),
    ]
}

/// Decode the VLAN columns of a Port row.
pub fn parse_vlan_state(row: &Value) -> PortVlanState {
    let number = |v: &Value| v.as_u64().and_then(|n| u16::try_from(n).ok());
    let mut trunks: Vec<u16> = set_members(&row["trunks"]).iter().filter_map(number).collect();
    trunks.sort_unstable();
    PortVlanState {
        mode: set_members(&row["vlan_mode"])
            .first()
            .and_then(|m| m.as_str())
            .unwrap_or_default()
            .to_string(),
        tag: set_members(&row["tag"]).first().and_then(number),
        trunks,
    }
}

impl SwitchDb for OvsdbClient {
    fn create_port(&self, bridge: &str, port: &PortSpec) -> Result<()> {
        let results = self
            .transact(create_port_operations(bridge, port))
            .with_context(|| format!("failed to create port {} on bridge {}", port.name, bridge))?;
        // ovsdb-server answers a mutate that matched nothing with count 0
        // and garbage-collects the orphaned rows, so the reply is not an error
        if mutated_rows(results.last()) != 1 {
            return Err(OvsCniError::Ovsdb(format!(
                "failed to create port {}: bridge {} not found",
                port.name, bridge
            ))
            .into());
        }
        info!(port = %port.name, bridge, vlan_mode = port.vlan.mode(), "created OVS port");
        Ok(())
    }

    fn delete_port(&self, bridge: &str, port_name: &str) -> Result<()> {
        let row = self.port_row(port_name, &["_uuid"])?;
        let port_uuid = uuid_of(&row["_uuid"])
            .ok_or_else(|| OvsCniError::Ovsdb(format!("port {} has no uuid", port_name)))?;

        self.transact(vec![
            json!({
                "op": "mutate",
                "table": "Bridge",
                "where": [["name", "==", bridge]],
                "mutations": [["ports", "delete", ["uuid", port_uuid]]]
            }),
            json!({ "op": "delete", "table": "Port", "where": [["_uuid", "==", ["uuid", port_uuid]]] }),
        ])
        .with_context(|| format!("failed to delete port {} from bridge {}", port_name, bridge))?;
        info!(port = %port_name, bridge, "deleted OVS port");
        Ok(())
    }

    fn find_port_for_container_iface(
        &self,
        container_iface: &str,
        netns: &str,
    ) -> Result<Option<String>> {
        let condition = json!([[
            "external_ids",
            "includes",
            ovs_map(&[("contNetns", netns), ("contIface", container_iface)])
        ]]);
        let rows = self.select("Port", condition, &["name"])?;
        Ok(rows
            .first()
            .and_then(|r| r["name"].as_str())
            .map(String::from))
    }

    fn interfaces_in_error(&self) -> Result<Vec<String>> {
        let rows = self.select("Interface", json!([]), &["name", "error"])?;
        Ok(rows
            .iter()
            .filter(|r| set_members(&r["error"]).iter().any(|e| e.is_string()))
            .filter_map(|r| r["name"].as_str().map(String::from))
            .collect())
    }

    fn bridge_exists(&self, bridge: &str) -> Result<bool> {
        let rows = self.select("Bridge", json!([["name", "==", bridge]]), &["name"])?;
        Ok(!rows.is_empty())
    }

    fn bridge_for_interface(&self, iface: &str) -> Result<String> {
        let iface_uuid = self
            .select("Interface", json!([["name", "==", iface]]), &["_uuid"])?
            .first()
            .and_then(|r| uuid_of(&r["_uuid"]))
            .ok_or_else(|| OvsCniError::Ovsdb(format!("interface {} not found", iface)))?;

        let port_uuid = self
            .select(
                "Port",
                json!([["interfaces", "includes", ["uuid", iface_uuid]]]),
                &["_uuid"],
            )?
            .first()
            .and_then(|r| uuid_of(&r["_uuid"]))
            .ok_or_else(|| OvsCniError::Ovsdb(format!("no port holds interface {}", iface)))?;

        self.select(
            "Bridge",
            json!([["ports", "includes", ["uuid", port_uuid]]]),
            &["name"],
        )?
        .first()
        .and_then(|r| r["name"].as_str())
        .map(String::from)
        .ok_or_else(|| OvsCniError::Ovsdb(format!("no bridge holds interface {}", iface)).into())
    }

    fn port_link_state(&self, port_name: &str) -> Result<String> {
        let row = self
            .select("Interface", json!([["name", "==", port_name]]), &["link_state"])?
            .into_iter()
            .next()
            .ok_or_else(|| OvsCniError::Ovsdb(format!("interface {} not found", port_name)))?;
        Ok(set_members(&row["link_state"])
            .first()
            .and_then(|s| s.as_str())
            .unwrap_or_default()
            .to_string())
    }

    fn port_vlan_state(&self, port_name: &str) -> Result<PortVlanState> {
        let row = self.port_row(port_name, &["vlan_mode", "tag", "trunks"])?;
        Ok(parse_vlan_state(&row))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixListener;
    use std::thread;
    use tempfile::TempDir;

    /// Serve one connection on a unix socket, answering the first request with `result`.
    fn scripted_server(result: Value) -> (TempDir, String, thread::JoinHandle<Value>) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let handle = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut buffer = Vec::new();
            let mut chunk = [0u8; 4096];
            let request = loop {
                let n = conn.read(&mut chunk).unwrap();
                assert!(n > 0, "client hung up before sending a request");
                buffer.extend_from_slice(&chunk[..n]);
                match serde_json::from_slice::<Value>(&buffer) {
                    Ok(request) => break request,
                    Err(e) if e.is_eof() => continue,
                    Err(e) => panic!("malformed request: {}", e),
                }
            };
            let reply = json!({ "id": request["id"], "result": result, "error": null });
            conn.write_all(reply.to_string().as_bytes()).unwrap();
            request
        });
        (dir, format!("unix:{}", path.display()), handle)
    }

    fn spec(vlan: VlanPolicy) -> PortSpec {
        PortSpec {
            name: "veth0a1b2c3d".into(),
            netns: "/var/run/netns/pod".into(),
            container_iface: "eth1".into(),
            ovn_port: None,
            ofport_request: None,
            vlan,
            interface_type: None,
            pod_uid: Some("uid-1".into()),
        }
    }

    #[test]
    fn endpoints_parse() {
        assert_eq!(
            Endpoint::parse("unix:/var/run/openvswitch/db.sock").unwrap(),
            Endpoint::Unix("/var/run/openvswitch/db.sock".into())
        );
        assert_eq!(Endpoint::parse("tcp:127.0.0.1:6640").unwrap(), Endpoint::Tcp("127.0.0.1:6640".into()));
        assert!(Endpoint::parse("ssl:1.2.3.4:6640").is_err());
    }

    #[test]
    fn access_port_row_carries_tag() {
        let ops = create_port_operations("br0", &spec(VlanPolicy::Access { tag: 100 }));
        let port = &ops[1]["row"];
        assert_eq!(port["tag"], 100);
        assert_eq!(port["vlan_mode"], "access");
        assert!(port.get("trunks").is_none());
        assert_eq!(ops[2]["where"][0][2], "br0");
    }

    #[test]
    fn trunk_port_row_carries_set() {
        let ops = create_port_operations("br0", &spec(VlanPolicy::Trunk { ids: vec![10, 11] }));
        let port = &ops[1]["row"];
        assert_eq!(port["trunks"], json!(["set", [10, 11]]));
        assert_eq!(port["vlan_mode"], "trunk");
        assert!(port.get("tag").is_none());
    }

    #[test]
    fn external_ids_locate_container() {
        let ops = create_port_operations("br0", &spec(VlanPolicy::Unrestricted));
        let ids = ops[1]["row"]["external_ids"][1].as_array().unwrap().clone();
        assert!(ids.contains(&json!(["contNetns", "/var/run/netns/pod"])));
        assert!(ids.contains(&json!(["contIface", "eth1"])));
        assert!(ids.contains(&json!(["contPodUid", "uid-1"])));
    }

    #[test]
    fn vlan_state_decodes_empty_sets() {
        let state = parse_vlan_state(&json!({
            "vlan_mode": ["set", []],
            "tag": ["set", []],
            "trunks": ["set", []]
        }));
        assert_eq!(state, PortVlanState::default());

        let state = parse_vlan_state(&json!({
            "vlan_mode": "trunk",
            "tag": ["set", []],
            "trunks": ["set", [12, 10, 11]]
        }));
        assert_eq!(state.trunks, vec![10, 11, 12]);
        assert_eq!(state.mode, "trunk");

        let state = parse_vlan_state(&json!({"vlan_mode": "access", "tag": 7, "trunks": 9}));
        assert_eq!(state.tag, Some(7));
        assert_eq!(state.trunks, vec![9]);
    }

    #[test]
    fn create_port_on_missing_bridge_fails() {
        let (_dir, socket, server) = scripted_server(json!([
            {"uuid": ["uuid", "5b1e0d2c-0000-0000-0000-000000000001"]},
            {"uuid": ["uuid", "5b1e0d2c-0000-0000-0000-000000000002"]},
            {"count": 0}
        ]));
        let client = OvsdbClient::new(&socket).unwrap();
        let err = client
            .create_port("br-does-not-exist", &spec(VlanPolicy::Unrestricted))
            .unwrap_err();
        assert!(err.to_string().contains("bridge br-does-not-exist not found"));
        assert_eq!(OvsCniError::code_of(&err), crate::error::CODE_PLUGIN);

        let request = server.join().unwrap();
        assert_eq!(request["method"], "transact");
        assert_eq!(request["params"][3]["where"][0][2], "br-does-not-exist");
    }

    #[test]
    fn create_port_on_existing_bridge_succeeds() {
        let (_dir, socket, server) = scripted_server(json!([
            {"uuid": ["uuid", "5b1e0d2c-0000-0000-0000-000000000001"]},
            {"uuid": ["uuid", "5b1e0d2c-0000-0000-0000-000000000002"]},
            {"count": 1}
        ]));
        let client = OvsdbClient::new(&socket).unwrap();
        client
            .create_port("br0", &spec(VlanPolicy::Access { tag: 100 }))
            .unwrap();
        server.join().unwrap();
    }

    #[test]
    fn partial_reply_waits_for_more() {
        assert!(next_reply(br#"{"id":0,"result":[{"rows"#).unwrap().is_none());
        let reply = next_reply(br#"{"method":"echo","params":[],"id":"echo"}{"id":0,"result":[],"error":null}"#)
            .unwrap()
            .unwrap();
        assert_eq!(reply["id"], 0);
    }
}
