use std::net::TcpListener;

use pgas_runtime::{Runtime, config::Config};

/// Reserve `n` distinct loopback ports by binding and immediately releasing
/// them; the cluster rebinds them right away.
pub fn free_ports(n: usize) -> Vec<u16> {
    let listeners: Vec<TcpListener> = (0..n)
        .map(|_| TcpListener::bind("127.0.0.1:0").unwrap())
        .collect();

    listeners
        .iter()
        .map(|listener| listener.local_addr().unwrap().port())
        .collect()
}

pub fn cluster_config(local: u16, ports: &[u16], region: u64, heap: usize) -> Config {
    let mut text = format!("local_node_id = {}\nnum_nodes = {}\n", local, ports.len());
    for (id, port) in ports.iter().enumerate() {
        text.push_str(&format!("node{} = 127.0.0.1:{}:0x0:{}\n", id, port, region));
    }
    text.push_str(&format!("heap_size = {}\n", heap));

    Config::parse(&text).unwrap()
}

/// Boot an `n` node cluster inside this process. Every node must bootstrap
/// concurrently: each one dials all the others while accepting from them.
pub async fn cluster(n: usize, region: u64, heap: usize) -> Vec<Runtime> {
    let _ = simple_logger::init_with_level(log::Level::Warn);

    let ports = free_ports(n);
    let mut boots = Vec::new();
    for id in 0..n {
        let config = cluster_config(id as u16, &ports, region, heap);
        boots.push(tokio::spawn(Runtime::with_config(config)));
    }

    let mut nodes = Vec::new();
    for boot in boots {
        nodes.push(boot.await.unwrap().unwrap());
    }

    nodes
}

pub async fn teardown(nodes: Vec<Runtime>) {
    for node in &nodes {
        node.finalize().await;
    }
}
