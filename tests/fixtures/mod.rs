#![allow(dead_code)]

use std::time::{Duration, Instant};

use weft_rs::config::Config;
use weft_rs::core::InstanceId;
use weft_rs::runtime::Runtime;
use weft_rs::test_harness::LoopbackFabric;

/// A set of runtime instances wired over one loopback fabric, every pair
/// of peers registered in both directions.
pub struct Rig {
    pub fabric: LoopbackFabric,
    nodes: Vec<Runtime>,
}

impl Rig {
    pub fn new(node_count: usize) -> Self {
        Self::with_config(node_count, Config::default())
    }

    pub fn with_config(node_count: usize, config: Config) -> Self {
        assert!(node_count > 0, "node_count must be > 0");
        let fabric = LoopbackFabric::new();
        let mut nodes = Vec::with_capacity(node_count);
        for index in 0..node_count {
            let worker = fabric.create_worker();
            let runtime = Runtime::build(
                config.clone(),
                InstanceId::new(index as u64 + 1),
                worker,
            );
            runtime.start();
            nodes.push(runtime);
        }
        for a in 0..node_count {
            for b in 0..node_count {
                if a == b {
                    continue;
                }
                nodes[a]
                    .add_peer(nodes[b].instance_id(), &nodes[b].address())
                    .expect("register peer");
            }
        }
        Self { fabric, nodes }
    }

    pub fn node(&self, index: usize) -> &Runtime {
        &self.nodes[index]
    }

    pub fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown();
        }
    }
}

/// Poll `condition` until it holds or the timeout elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
