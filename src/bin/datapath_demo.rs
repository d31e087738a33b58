//! Opens a datapath, attaches a couple of dummy ports, and installs
//! whatever static flows a JSON config names. Exists to exercise the
//! control-op surface end to end; not a deployment target.

use flowdp::datapath::FP_CREATE;
use flowdp::port::DummyNetDev;
use flowdp::{attr, flow_key, registry};

use serde::Deserialize;
use std::env;
use std::fs;

#[derive(Deserialize)]
struct StaticFlow {
    in_port: u32,
    out_port: u32,
}

#[derive(Deserialize, Default)]
struct DemoConfig {
    #[serde(default)]
    flows: Vec<StaticFlow>,
}

fn load_config(path: Option<String>) -> DemoConfig {
    match path {
        Some(p) => {
            let text = fs::read_to_string(&p).unwrap_or_else(|e| panic!("cannot read {}: {}", p, e));
            serde_json::from_str(&text).unwrap_or_else(|e| panic!("invalid config {}: {}", p, e))
        }
        None => DemoConfig::default(),
    }
}

fn main() {
    env_logger::init();
    let config = load_config(env::args().nth(1));

    let dp = registry::open(registry::DEFAULT_CLASS, "demo0", true).expect("open datapath");
    dp.port_add("p1", "dummy", Box::new(DummyNetDev::new()), Some(1)).expect("port_add p1");
    dp.port_add("p2", "dummy", Box::new(DummyNetDev::new()), Some(2)).expect("port_add p2");

    for flow in &config.flows {
        let key = flow_key::FlowKey { in_port: flow.in_port, ..Default::default() };
        let key_bytes = flow_key::key_from_flow(&key);
        let mut action_bytes = Vec::new();
        attr::put_u32(&mut action_bytes, flowdp::actions::ACTION_OUTPUT, flow.out_port);
        dp.flow_put(FP_CREATE, &key_bytes, action_bytes).expect("flow_put");
        log::info!("installed static flow: in_port {} -> out_port {}", flow.in_port, flow.out_port);
    }

    log::info!("{}: {} static flows, stats {:?}", dp.name(), config.flows.len(), dp.get_stats());
}
