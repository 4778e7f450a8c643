use std::{
    collections::HashMap,
    fs::read_to_string,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail, ensure};

/// Hard cluster-size ceiling; the symmetric barrier and the all-pairs
/// socket mesh are sized for small clusters.
pub const MAX_NODES: usize = 16;

/// Static descriptor of one participating process.
///
/// `cxl_base` is the address the node *declares* for its CXL window; it is
/// informational only. The mapped base actually used for translation is
/// discovered when the local region is acquired.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: u16,
    pub host: String,
    pub port: u16,
    pub cxl_base: u64,
    pub cxl_size: u64,
}

/// Cluster configuration, one entry per line:
///
/// ```text
/// # pgas cluster
/// local_node_id = 0
/// num_nodes = 2
/// node0 = 10.0.0.1:7700:0x100000000:1073741824
/// node1 = 10.0.0.2:7700:0x100000000:1073741824
/// ```
///
/// Optional keys: `heap_size` (bytes managed by the allocator at the low
/// end of the segment, default one GiB capped at the segment size) and
/// `dax_device` (path of a pre-resolved CXL DAX device; anonymous memory
/// is used when absent).
#[derive(Debug, Clone)]
pub struct Config {
    pub local_node_id: u16,
    pub nodes: Vec<Node>,
    pub heap_size: Option<usize>,
    pub dax_device: Option<PathBuf>,
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        Self::parse(
            &read_to_string(path)
                .with_context(|| format!("failed to read config file {:?}", path))?,
        )
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut entries = HashMap::new();
        for (index, line) in text.lines().enumerate() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                bail!("config line {}: expected `key = value`", index + 1);
            };

            entries.insert(key.trim().to_string(), value.trim().to_string());
        }

        let local_node_id = require(&entries, "local_node_id")?
            .parse::<u16>()
            .context("local_node_id must be a u16")?;
        let num_nodes = require(&entries, "num_nodes")?
            .parse::<u16>()
            .context("num_nodes must be a u16")?;

        ensure!(num_nodes >= 1, "num_nodes must be at least 1");
        ensure!(
            (num_nodes as usize) <= MAX_NODES,
            "num_nodes exceeds the {} node limit",
            MAX_NODES
        );
        ensure!(
            local_node_id < num_nodes,
            "local_node_id {} outside the node table",
            local_node_id
        );

        let mut nodes = Vec::with_capacity(num_nodes as usize);
        for id in 0..num_nodes {
            let key = format!("node{}", id);
            let value = require(&entries, &key)?;
            nodes.push(parse_node(id, value).with_context(|| format!("bad {} entry", key))?);
        }

        let heap_size = match entries.get("heap_size") {
            Some(value) => Some(value.parse::<usize>().context("heap_size must be bytes")?),
            None => None,
        };

        Ok(Self {
            local_node_id,
            nodes,
            heap_size,
            dax_device: entries.get("dax_device").map(PathBuf::from),
        })
    }

    pub fn local(&self) -> &Node {
        &self.nodes[self.local_node_id as usize]
    }

    pub fn num_nodes(&self) -> u16 {
        self.nodes.len() as u16
    }
}

fn require<'a>(entries: &'a HashMap<String, String>, key: &str) -> Result<&'a str> {
    entries
        .get(key)
        .map(|value| value.as_str())
        .with_context(|| format!("missing config key `{}`", key))
}

/// `<host>:<port>:<cxl_base_hex>:<cxl_size_dec>`
fn parse_node(id: u16, value: &str) -> Result<Node> {
    let parts: Vec<&str> = value.split(':').collect();
    ensure!(
        parts.len() == 4,
        "expected host:port:cxl_base_hex:cxl_size_dec"
    );

    let base = parts[2].trim_start_matches("0x");
    Ok(Node {
        id,
        host: parts[0].to_string(),
        port: parts[1].parse::<u16>().context("port must be a u16")?,
        cxl_base: u64::from_str_radix(base, 16).context("cxl_base must be hex")?,
        cxl_size: parts[3].parse::<u64>().context("cxl_size must be bytes")?,
    })
}

#[cfg(test)]
mod tests {
    use super::Config;

    const SAMPLE: &str = r#"
        # two node cluster
        local_node_id = 1
        num_nodes = 2
        node0 = 127.0.0.1:7700:0x100000000:1048576
        node1 = 127.0.0.1:7701:0x100000000:1048576   # peer
        heap_size = 262144
    "#;

    #[test]
    fn parses_a_cluster() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.local_node_id, 1);
        assert_eq!(config.num_nodes(), 2);
        assert_eq!(config.heap_size, Some(262144));
        assert_eq!(config.dax_device, None);

        let node = config.local();
        assert_eq!(node.id, 1);
        assert_eq!(node.port, 7701);
        assert_eq!(node.cxl_base, 0x1_0000_0000);
        assert_eq!(node.cxl_size, 1048576);
    }

    #[test]
    fn rejects_incomplete_tables() {
        assert!(Config::parse("local_node_id = 0\nnum_nodes = 2\nnode0 = a:1:0:1").is_err());
        assert!(Config::parse("num_nodes = 1\nnode0 = a:1:0:1").is_err());
        assert!(Config::parse("local_node_id = 2\nnum_nodes = 2").is_err());
    }

    #[test]
    fn rejects_oversized_clusters() {
        let mut text = String::from("local_node_id = 0\nnum_nodes = 17\n");
        for id in 0..17 {
            text.push_str(&format!("node{} = 127.0.0.1:{}:0x0:4096\n", id, 7000 + id));
        }

        assert!(Config::parse(&text).is_err());
    }

    #[test]
    fn rejects_malformed_node_entries() {
        let text = "local_node_id = 0\nnum_nodes = 1\nnode0 = 127.0.0.1:7700:0x0";
        assert!(Config::parse(text).is_err());
    }
}
