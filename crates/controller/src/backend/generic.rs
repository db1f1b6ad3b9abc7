use common::api::VpnBackend;
use serde_json::{Map, Value, json};

use super::{AutoClientRequest, Backend, CompileError, RenderInput, RenderedFile, Violation};

const NETJSON_SCHEMA: &str = include_str!("../../schemas/netjson.json");

/// How a compiled document is laid out in the package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// The whole document in one `config.json`.
    SingleDocument,
    /// One file per top-level section under `etc/config/`.
    PerSection,
}

/// Schema-validated backend rendering JSON documents.
pub struct GenericBackend {
    id: String,
    layout: Layout,
    dsa: bool,
    schema: Value,
    validator: jsonschema::Validator,
}

impl std::fmt::Debug for GenericBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenericBackend")
            .field("id", &self.id)
            .field("layout", &self.layout)
            .field("dsa", &self.dsa)
            .finish_non_exhaustive()
    }
}

impl GenericBackend {
    pub fn new(
        id: impl Into<String>,
        layout: Layout,
        dsa: bool,
        schema: Value,
    ) -> Result<Self, CompileError> {
        let validator =
            jsonschema::validator_for(&schema).map_err(|err| CompileError::Schema(err.to_string()))?;
        Ok(Self {
            id: id.into(),
            layout,
            dsa,
            schema,
            validator,
        })
    }

    pub fn netjson() -> Result<Self, CompileError> {
        Self::new("netjson", Layout::SingleDocument, false, netjson_schema()?)
    }

    pub fn openwrt() -> Result<Self, CompileError> {
        Self::new("openwrt", Layout::PerSection, true, netjson_schema()?)
    }

    fn check(&self, document: &Value) -> Result<(), CompileError> {
        let violations: Vec<Violation> = self
            .validator
            .iter_errors(document)
            .map(|err| Violation {
                path: err.instance_path().to_string(),
                message: err.to_string(),
            })
            .collect();
        if violations.is_empty() {
            Ok(())
        } else {
            Err(CompileError::Validation(violations))
        }
    }
}

fn netjson_schema() -> Result<Value, CompileError> {
    serde_json::from_str(NETJSON_SCHEMA).map_err(|err| CompileError::Schema(err.to_string()))
}

fn pretty(value: &Value) -> String {
    let mut text = serde_json::to_string_pretty(value).unwrap_or_default();
    text.push('\n');
    text
}

fn extra_files(document: &Value) -> Vec<RenderedFile> {
    document
        .get("files")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|file| {
            let path = file.get("path")?.as_str()?;
            let contents = file.get("contents")?.as_str()?;
            let mode = file
                .get("mode")
                .and_then(Value::as_str)
                .and_then(|mode| u32::from_str_radix(mode, 8).ok())
                .unwrap_or(0o644);
            Some(RenderedFile::new(path, mode, contents))
        })
        .collect()
}

impl Backend for GenericBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn schema(&self) -> &Value {
        &self.schema
    }

    fn supports_dsa(&self) -> bool {
        self.dsa
    }

    fn validate(&self, input: &RenderInput<'_>) -> Result<Value, CompileError> {
        let document = self.document(input);
        self.check(&document)?;
        Ok(document)
    }

    fn render(&self, input: &RenderInput<'_>) -> Result<Vec<RenderedFile>, CompileError> {
        let mut document = self.validate(input)?;
        let files = extra_files(&document);
        if let Value::Object(root) = &mut document {
            root.remove("files");
        }

        let mut rendered = Vec::new();
        match self.layout {
            Layout::SingleDocument => {
                rendered.push(RenderedFile::new("config.json", 0o644, pretty(&document)));
            }
            Layout::PerSection => {
                if let Value::Object(root) = &document {
                    for (section, value) in root {
                        rendered.push(RenderedFile::new(
                            format!("etc/config/{section}"),
                            0o644,
                            pretty(value),
                        ));
                    }
                }
                if self.dsa {
                    let dsa = input.options.dsa.unwrap_or(true);
                    rendered.push(RenderedFile::new(
                        "etc/devconf/switch",
                        0o644,
                        format!("dsa={}\n", u8::from(dsa)),
                    ));
                }
            }
        }
        rendered.extend(files);
        Ok(rendered)
    }

    fn auto_client(&self, request: &AutoClientRequest<'_>) -> Option<Value> {
        match request.vpn_backend {
            VpnBackend::OpenVpn => Some(openvpn_client(request)),
            VpnBackend::WireGuard => Some(wireguard_client(request, false)),
            VpnBackend::Vxlan => Some(wireguard_client(request, true)),
            VpnBackend::Generic => None,
        }
    }
}

fn openvpn_client(request: &AutoClientRequest<'_>) -> Value {
    let hex = request.vpn_hex;
    let server = request
        .server
        .get("openvpn")
        .and_then(Value::as_array)
        .and_then(|servers| servers.first())
        .cloned()
        .unwrap_or_else(|| Value::Object(Map::new()));

    let port = server.get("port").and_then(Value::as_u64).unwrap_or(1194);
    let proto = match server.get("proto").and_then(Value::as_str) {
        Some("tcp-server") => "tcp-client",
        Some(other) => other,
        None => "udp",
    };
    let name = slug(request.vpn_name);

    let mut client = json!({
        "name": name,
        "mode": "p2p",
        "proto": proto,
        "remote": [{"host": request.host, "port": port}],
        "pull": true,
        "tls_client": true,
        "ca": format!("{{{{ca_path_{hex}}}}}"),
    });
    for key in ["dev_type", "cipher", "auth", "comp_lzo"] {
        if let (Some(value), Value::Object(client)) = (server.get(key), &mut client) {
            client.insert(key.into(), value.clone());
        }
    }

    let mut files = vec![json!({
        "path": format!("{{{{ca_path_{hex}}}}}"),
        "mode": "0600",
        "contents": format!("{{{{ca_contents_{hex}}}}}"),
    })];
    if request.auto_cert {
        if let Value::Object(client) = &mut client {
            client.insert("cert".into(), json!(format!("{{{{cert_path_{hex}}}}}")));
            client.insert("key".into(), json!(format!("{{{{key_path_{hex}}}}}")));
        }
        files.push(json!({
            "path": format!("{{{{cert_path_{hex}}}}}"),
            "mode": "0600",
            "contents": format!("{{{{cert_contents_{hex}}}}}"),
        }));
        files.push(json!({
            "path": format!("{{{{key_path_{hex}}}}}"),
            "mode": "0600",
            "contents": format!("{{{{key_contents_{hex}}}}}"),
        }));
    }

    json!({"openvpn": [client], "files": files})
}

fn interface_name(prefix: &str, vpn_name: &str) -> String {
    format!("{prefix}{}", slug(vpn_name)).chars().take(15).collect()
}

/// WireGuard interface peering with the server, optionally carrying a
/// VXLAN tunnel over it.
fn wireguard_client(request: &AutoClientRequest<'_>, vxlan: bool) -> Value {
    let hex = request.vpn_hex;
    let server = request
        .server
        .get("wireguard")
        .and_then(Value::as_array)
        .and_then(|servers| servers.first());
    let port = server
        .and_then(|server| server.get("port"))
        .and_then(Value::as_u64)
        .unwrap_or(51820);
    let wg_name = interface_name("wg-", request.vpn_name);

    let mut interfaces = vec![json!({
        "name": wg_name,
        "type": "wireguard",
        "private_key": format!("{{{{pvt_key_{hex}}}}}"),
        "mtu": 1420,
        "addresses": [{
            "proto": "static",
            "family": "ipv4",
            "address": format!("{{{{ip_address_{hex}}}}}"),
            "mask": 32,
        }],
    })];
    if vxlan {
        interfaces.push(json!({
            "name": interface_name("vx-", request.vpn_name),
            "type": "vxlan",
            "vtep": format!("{{{{server_ip_address_{hex}}}}}"),
            "port": 4789,
            "vni": format!("{{{{vni_{hex}}}}}"),
            "tunlink": wg_name,
            "mtu": 1280,
        }));
    }
    json!({
        "interfaces": interfaces,
        "wireguard_peers": [{
            "interface": wg_name,
            "public_key": format!("{{{{public_key_{hex}}}}}"),
            "allowed_ips": [format!("{{{{vpn_subnet_{hex}}}}}")],
            "endpoint_host": request.host,
            "endpoint_port": port,
            "persistent_keepalive": 60,
            "route_allowed_ips": true,
        }],
    })
}

/// Lowercase ascii alphanumerics, everything else collapsed to `-`.
pub fn slug(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
        } else if !out.ends_with('-') && !out.is_empty() {
            out.push('-');
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RenderOptions;
    use crate::context::{ContextFunctions, ContextResolver, ResolvedContext};

    fn context() -> ResolvedContext {
        let resolver = ContextResolver::new(
            [("tz".to_string(), json!("Europe/Rome"))].into_iter().collect(),
            ContextFunctions::new(),
            false,
        );
        resolver.template_context(&Default::default(), None)
    }

    fn input<'a>(
        config: &'a Value,
        fragments: &'a [Value],
        context: &'a ResolvedContext,
        options: RenderOptions,
    ) -> RenderInput<'a> {
        RenderInput {
            config,
            fragments,
            context,
            device_name: Some("ap:1"),
            options,
        }
    }

    #[test]
    fn generate_is_deterministic_and_order_sensitive() {
        let backend = GenericBackend::netjson().expect("backend");
        let ctx = context();
        let config = json!({"general": {"timezone": "{{ tz }}"}});
        let a = json!({"general": {"description": "a"}});
        let b = json!({"general": {"description": "b"}});

        let forward = [a.clone(), b.clone()];
        let reverse = [b, a];
        let first = backend
            .generate(&input(&config, &forward, &ctx, RenderOptions::default()))
            .expect("generate");
        let again = backend
            .generate(&input(&config, &forward, &ctx, RenderOptions::default()))
            .expect("generate");
        let swapped = backend
            .generate(&input(&config, &reverse, &ctx, RenderOptions::default()))
            .expect("generate");

        assert_eq!(first, again);
        assert_ne!(first, swapped);
    }

    #[test]
    fn render_substitutes_and_defaults_hostname() {
        let backend = GenericBackend::netjson().expect("backend");
        let ctx = context();
        let config = json!({"general": {"timezone": "{{ tz }}"}});
        let files = backend
            .render(&input(&config, &[], &ctx, RenderOptions::default()))
            .expect("render");
        assert_eq!(files.len(), 1);
        let doc: Value = serde_json::from_str(&files[0].contents).expect("json");
        assert_eq!(doc["general"]["timezone"], "Europe/Rome");
        assert_eq!(doc["general"]["hostname"], "ap-1");
    }

    #[test]
    fn validation_error_carries_json_pointer() {
        let backend = GenericBackend::netjson().expect("backend");
        let ctx = context();
        let config = json!({"interfaces": [{"name": "eth0", "type": "bogus"}]});
        let err = backend
            .validate(&input(&config, &[], &ctx, RenderOptions::default()))
            .expect_err("invalid");
        assert_eq!(err.violations().len(), 1);
        assert_eq!(err.violations()[0].path, "/interfaces/0/type");
        assert!(
            err.to_string()
                .starts_with("Invalid configuration triggered by \"#/interfaces/0/type\", validator says:\n\n")
        );
    }

    #[test]
    fn every_violation_is_reported() {
        let backend = GenericBackend::netjson().expect("backend");
        let ctx = context();
        let config = json!({
            "interfaces": [{"name": "eth0", "type": "bogus", "mtu": 10}]
        });
        let err = backend
            .validate(&input(&config, &[], &ctx, RenderOptions::default()))
            .expect_err("invalid");
        let mut paths: Vec<&str> = err.violations().iter().map(|v| v.path.as_str()).collect();
        paths.sort_unstable();
        assert_eq!(paths, vec!["/interfaces/0/mtu", "/interfaces/0/type"]);
        let message = err.to_string();
        assert!(message.contains("\"#/interfaces/0/mtu\""));
        assert!(message.contains("\"#/interfaces/0/type\""));
    }

    #[test]
    fn per_section_layout_writes_switch_model() {
        let backend = GenericBackend::openwrt().expect("backend");
        let ctx = context();
        let config = json!({
            "interfaces": [{"name": "lan", "type": "bridge"}],
            "files": [{"path": "/etc/motd", "mode": "0600", "contents": "hi"}]
        });
        let legacy = backend
            .render(&input(&config, &[], &ctx, RenderOptions { dsa: Some(false) }))
            .expect("render");
        let paths: Vec<_> = legacy.iter().map(|file| file.path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["etc/config/general", "etc/config/interfaces", "etc/devconf/switch", "/etc/motd"]
        );
        assert_eq!(legacy[2].contents, "dsa=0\n");
        assert_eq!(legacy[3].mode, 0o600);

        let modern = backend
            .generate(&input(&config, &[], &ctx, RenderOptions { dsa: Some(true) }))
            .expect("generate");
        let old = backend
            .generate(&input(&config, &[], &ctx, RenderOptions { dsa: Some(false) }))
            .expect("generate");
        assert_ne!(modern, old);
    }

    #[test]
    fn openvpn_auto_client_omits_cert_when_not_auto() {
        let backend = GenericBackend::netjson().expect("backend");
        let server = json!({"openvpn": [{"name": "srv", "mode": "server", "proto": "tcp-server", "port": 1195}]});
        let request = AutoClientRequest {
            vpn_backend: VpnBackend::OpenVpn,
            vpn_name: "Office VPN",
            vpn_hex: "abc",
            host: "vpn.example.com",
            server: &server,
            auto_cert: false,
        };
        let fragment = backend.auto_client(&request).expect("fragment");
        let client = &fragment["openvpn"][0];
        assert_eq!(client["name"], "office-vpn");
        assert_eq!(client["proto"], "tcp-client");
        assert_eq!(client["remote"][0]["port"], 1195);
        assert_eq!(client["ca"], "{{ca_path_abc}}");
        assert!(client.get("cert").is_none());
        assert_eq!(fragment["files"].as_array().map(Vec::len), Some(1));

        let with_cert = backend
            .auto_client(&AutoClientRequest {
                auto_cert: true,
                ..request
            })
            .expect("fragment");
        assert_eq!(with_cert["openvpn"][0]["cert"], "{{cert_path_abc}}");
        assert_eq!(with_cert["files"].as_array().map(Vec::len), Some(3));

        assert!(
            backend
                .auto_client(&AutoClientRequest {
                    vpn_backend: VpnBackend::Generic,
                    ..request
                })
                .is_none()
        );
    }

    #[test]
    fn vxlan_client_rides_on_a_wireguard_interface() {
        let backend = GenericBackend::netjson().expect("backend");
        let server = json!({"wireguard": [{"name": "wg0", "port": 51821}]});
        let request = AutoClientRequest {
            vpn_backend: VpnBackend::WireGuard,
            vpn_name: "Branch Offices Mesh",
            vpn_hex: "abc",
            host: "wg.example.com",
            server: &server,
            auto_cert: true,
        };
        let fragment = backend.auto_client(&request).expect("fragment");
        let interfaces = fragment["interfaces"].as_array().expect("interfaces");
        assert_eq!(interfaces.len(), 1);
        assert_eq!(interfaces[0]["name"], "wg-branch-offic");
        assert_eq!(interfaces[0]["private_key"], "{{pvt_key_abc}}");
        assert_eq!(interfaces[0]["addresses"][0]["address"], "{{ip_address_abc}}");
        let peer = &fragment["wireguard_peers"][0];
        assert_eq!(peer["public_key"], "{{public_key_abc}}");
        assert_eq!(peer["endpoint_port"], 51821);

        let fragment = backend
            .auto_client(&AutoClientRequest {
                vpn_backend: VpnBackend::Vxlan,
                ..request
            })
            .expect("fragment");
        let vxlan = &fragment["interfaces"][1];
        assert_eq!(vxlan["type"], "vxlan");
        assert_eq!(vxlan["vni"], "{{vni_abc}}");
        assert_eq!(vxlan["tunlink"], "wg-branch-offic");
        assert_eq!(vxlan["vtep"], "{{server_ip_address_abc}}");
    }

    #[test]
    fn slug_collapses_separators() {
        assert_eq!(slug("Office VPN (main)"), "office-vpn-main");
        assert_eq!(slug("--x--"), "x");
    }
}
