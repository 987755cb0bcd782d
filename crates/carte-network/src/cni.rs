//! CNI plugin networking.
//!
//! Reads the lexically first `.conf` or `.conflist` in the configuration
//! directory and runs its plugins in order with `CNI_COMMAND=ADD`, feeding
//! each plugin the previous one's result. Detach runs `DEL` in reverse.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ipnetwork::Ipv4Network;
use serde::Deserialize;
use serde_json::Value;

use carte_common::config::CniConfig;
use carte_common::constants::CONTAINER_IFNAME;
use carte_common::error::{CarteError, Result};
use carte_core::namespace::netns_path;

use crate::command::{HostCommand, Invocation};
use crate::{Attachment, NetworkAttacher};

/// A network configuration list.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkList {
    /// Network name.
    pub name: String,
    /// CNI version declared by the file.
    pub cni_version: String,
    /// Plugin configurations in execution order.
    pub plugins: Vec<Value>,
}

impl NetworkList {
    /// Parses a `.conf` (single plugin) or `.conflist` file.
    ///
    /// # Errors
    ///
    /// Returns a validation error for malformed files.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| CarteError::io(path, e))?;
        let value: Value = serde_json::from_str(&content)?;
        let field = |key: &str| value.get(key).and_then(Value::as_str).unwrap_or_default().to_string();
        let name = field("name");
        let cni_version = field("cniVersion");

        let plugins = if path.extension().is_some_and(|ext| ext == "conflist") {
            value
                .get("plugins")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default()
        } else {
            vec![value.clone()]
        };
        if plugins.is_empty() {
            return Err(CarteError::validation(format!(
                "CNI config {} lists no plugins",
                path.display()
            )));
        }
        if let Some(bad) = plugins.iter().position(|p| p.get("type").and_then(Value::as_str).is_none()) {
            return Err(CarteError::validation(format!(
                "CNI config {}: plugin {bad} has no type",
                path.display()
            )));
        }
        Ok(Self {
            name,
            cni_version,
            plugins,
        })
    }

    /// Loads the lexically first configuration in `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`CarteError::NotFound`] if the directory holds none.
    pub fn first_in(dir: &Path) -> Result<Self> {
        let listing = std::fs::read_dir(dir).map_err(|e| CarteError::io(dir, e))?;
        let mut files: Vec<PathBuf> = listing
            .filter_map(std::result::Result::ok)
            .map(|entry| entry.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "conf" || ext == "conflist"))
            .collect();
        files.sort();
        let first = files.into_iter().next().ok_or_else(|| CarteError::NotFound {
            kind: "CNI configuration",
            id: dir.display().to_string(),
        })?;
        tracing::debug!(path = %first.display(), "using CNI configuration");
        Self::from_file(&first)
    }

    /// Stdin for one plugin: its config plus the list's name and version.
    fn plugin_input(&self, plugin: &Value, prev_result: Option<&Value>) -> Value {
        let mut input = plugin.clone();
        if let Some(obj) = input.as_object_mut() {
            let _ = obj.insert("name".into(), Value::String(self.name.clone()));
            let _ = obj.insert("cniVersion".into(), Value::String(self.cni_version.clone()));
            if let Some(prev) = prev_result {
                let _ = obj.insert("prevResult".into(), prev.clone());
            }
        }
        input
    }
}

#[derive(Debug, Deserialize)]
struct CniResult {
    #[serde(default)]
    ips: Vec<CniIp>,
}

#[derive(Debug, Deserialize)]
struct CniIp {
    address: String,
    #[serde(default)]
    gateway: Option<Ipv4Addr>,
}

/// CNI strategy for [`NetworkAttacher`].
pub struct CniNetwork {
    conf_dir: PathBuf,
    bin_dir: PathBuf,
    commands: Arc<dyn HostCommand>,
}

impl std::fmt::Debug for CniNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CniNetwork")
            .field("conf_dir", &self.conf_dir)
            .field("bin_dir", &self.bin_dir)
            .finish_non_exhaustive()
    }
}

impl CniNetwork {
    /// Creates the strategy from configured paths.
    #[must_use]
    pub fn new(config: &CniConfig, commands: Arc<dyn HostCommand>) -> Self {
        Self {
            conf_dir: config.conf_dir.clone(),
            bin_dir: config.bin_dir.clone(),
            commands,
        }
    }

    fn invoke(&self, command: &str, container_id: &str, netns: &str, input: &Value) -> Result<Vec<u8>> {
        let plugin = input.get("type").and_then(Value::as_str).unwrap_or_default();
        let invocation = Invocation::new(self.bin_dir.join(plugin).display().to_string(), &[])
            .env("CNI_COMMAND", command)
            .env("CNI_CONTAINERID", container_id)
            .env("CNI_NETNS", netns)
            .env("CNI_IFNAME", CONTAINER_IFNAME)
            .env("CNI_PATH", self.bin_dir.display().to_string())
            .stdin(serde_json::to_vec(input)?);
        self.commands.run(&invocation).map_err(|e| CarteError::Network {
            message: format!("CNI plugin {plugin} {command} failed: {e}"),
        })
    }

    fn delete_chain(&self, list: &NetworkList, plugins: &[Value], container_id: &str, netns: &str) -> Result<()> {
        let mut first_error = None;
        for plugin in plugins.iter().rev() {
            let input = list.plugin_input(plugin, None);
            if let Err(e) = self.invoke("DEL", container_id, netns, &input) {
                tracing::warn!(container = container_id, error = %e, "CNI DEL failed");
                let _ = first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl NetworkAttacher for CniNetwork {
    fn attach(&self, container_id: &str, pid: u32, _preferred: Option<Ipv4Addr>) -> Result<Attachment> {
        let list = NetworkList::first_in(&self.conf_dir)?;
        let netns = netns_path(pid);
        let netns_str = netns.display().to_string();

        let mut prev: Option<Value> = None;
        for (index, plugin) in list.plugins.iter().enumerate() {
            let input = list.plugin_input(plugin, prev.as_ref());
            match self
                .invoke("ADD", container_id, &netns_str, &input)
                .and_then(|out| Ok(serde_json::from_slice::<Value>(&out)?))
            {
                Ok(result) => prev = Some(result),
                Err(e) => {
                    let _ = self.delete_chain(&list, &list.plugins[..index], container_id, &netns_str);
                    return Err(e);
                }
            }
        }

        let (cidr, gateway) = match final_address(&list.name, prev) {
            Ok(found) => found,
            Err(e) => {
                let _ = self.delete_chain(&list, &list.plugins, container_id, &netns_str);
                return Err(e);
            }
        };

        tracing::info!(container = container_id, network = %list.name, address = %cidr, "container attached via CNI");
        Ok(Attachment {
            ip_address: Some(cidr.ip()),
            prefix_len: Some(cidr.prefix()),
            gateway,
            netns: Some(netns),
        })
    }

    fn detach(&self, container_id: &str, attachment: &Attachment) -> Result<()> {
        let list = NetworkList::first_in(&self.conf_dir)?;
        let netns = attachment
            .netns
            .as_ref()
            .filter(|p| p.exists())
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        self.delete_chain(&list, &list.plugins, container_id, &netns)?;
        tracing::info!(container = container_id, network = %list.name, "container detached via CNI");
        Ok(())
    }
}

/// Address and gateway from the last plugin's result.
fn final_address(network: &str, result: Option<Value>) -> Result<(Ipv4Network, Option<Ipv4Addr>)> {
    let result: CniResult = match result {
        Some(value) => serde_json::from_value(value)?,
        None => CniResult { ips: Vec::new() },
    };
    let first = result.ips.first().ok_or_else(|| CarteError::Network {
        message: format!("CNI network {network} returned no addresses"),
    })?;
    let cidr = first.address.parse().map_err(|e| CarteError::Network {
        message: format!("CNI returned invalid address '{}': {e}", first.address),
    })?;
    Ok((cidr, first.gateway))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_conf_becomes_one_plugin_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("10-bridge.conf");
        std::fs::write(&path, r#"{"cniVersion":"0.4.0","name":"net","type":"bridge"}"#).unwrap();
        let list = NetworkList::from_file(&path).unwrap();
        assert_eq!(list.name, "net");
        assert_eq!(list.plugins.len(), 1);
    }

    #[test]
    fn first_config_is_lexical() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("20-b.conflist"),
            r#"{"cniVersion":"0.4.0","name":"b","plugins":[{"type":"bridge"}]}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("10-a.conf"), r#"{"cniVersion":"0.4.0","name":"a","type":"ptp"}"#).unwrap();
        std::fs::write(dir.path().join("00-notes.txt"), "ignored").unwrap();
        assert_eq!(NetworkList::first_in(dir.path()).unwrap().name, "a");
    }

    #[test]
    fn plugins_without_type_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("net.conflist");
        std::fs::write(&path, r#"{"name":"x","plugins":[{"ipam":{}}]}"#).unwrap();
        assert!(NetworkList::from_file(&path).unwrap_err().is_validation());
    }

    #[test]
    fn plugin_input_carries_prev_result() {
        let list = NetworkList {
            name: "n".into(),
            cni_version: "0.4.0".into(),
            plugins: vec![serde_json::json!({"type": "portmap"})],
        };
        let prev = serde_json::json!({"ips": []});
        let input = list.plugin_input(&list.plugins[0], Some(&prev));
        assert_eq!(input["name"], "n");
        assert_eq!(input["cniVersion"], "0.4.0");
        assert_eq!(input["prevResult"], prev);
    }

    #[test]
    fn final_address_rejects_missing_and_malformed_ips() {
        let ok = serde_json::json!({"ips": [{"address": "10.22.0.5/16", "gateway": "10.22.0.1"}]});
        let (cidr, gateway) = final_address("n", Some(ok)).unwrap();
        assert_eq!(cidr.ip(), Ipv4Addr::new(10, 22, 0, 5));
        assert_eq!(gateway, Some(Ipv4Addr::new(10, 22, 0, 1)));

        assert!(final_address("n", None).is_err());
        assert!(final_address("n", Some(serde_json::json!({"ips": []}))).is_err());
        let bad = serde_json::json!({"ips": [{"address": "not-an-address"}]});
        assert!(matches!(final_address("n", Some(bad)), Err(CarteError::Network { .. })));
    }
}
