//! A small CLI that builds a synthetic cluster and drives
//! `SelectCore::job_test` for manual inspection. Not part of the public
//! core API — a development aid, matching the teacher's convention of
//! shipping a `clap`-based binary entry point alongside the library.

use clap::{App, Arg};
use mimalloc::MiMalloc;
use select_linear_core::bitmap::Bitmap;
use select_linear_core::core::SelectCore;
use select_linear_core::gres::NullGresService;
use select_linear_core::planner::PreemptCandidate;
use select_linear_core::procs::LllpProcsOracle;
use select_linear_core::types::{
    CoreConfig, JobDetails, JobRecord, NodeHw, NodeRecord, NodeStateFlags, PartitionRecord, SelectMode,
};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn synthetic_nodes(count: usize, cpus: u32, memory: u32) -> Vec<NodeRecord> {
    (0..count)
        .map(|i| NodeRecord {
            index: i,
            name: format!("node{i:03}"),
            configured: NodeHw {
                cpus,
                sockets: 2,
                cores: cpus,
                threads: 1,
                real_memory: memory,
            },
            live: NodeHw {
                cpus,
                sockets: 2,
                cores: cpus,
                threads: 1,
                real_memory: memory,
            },
            gres: select_linear_core::gres::GresSpec::none(),
            partitions: vec![0],
            state: NodeStateFlags::default(),
        })
        .collect()
}

fn main() {
    env_logger::init();

    let matches = App::new("corectl")
        .version("0.1.0")
        .author("select-linear-core")
        .about("Drives the node-selection core against a synthetic cluster")
        .arg(
            Arg::with_name("nodes")
                .long("nodes")
                .takes_value(true)
                .default_value("8")
                .help("number of nodes in the synthetic cluster"),
        )
        .arg(
            Arg::with_name("cpus")
                .long("cpus")
                .takes_value(true)
                .default_value("4")
                .help("CPUs per node"),
        )
        .arg(
            Arg::with_name("min-cpus")
                .long("min-cpus")
                .takes_value(true)
                .default_value("8")
                .help("the test job's min_cpus"),
        )
        .arg(
            Arg::with_name("min-nodes")
                .long("min-nodes")
                .takes_value(true)
                .default_value("2")
                .help("the test job's min_nodes"),
        )
        .arg(
            Arg::with_name("contiguous")
                .long("contiguous")
                .help("require the placement to be one consecutive run"),
        )
        .arg(
            Arg::with_name("mode")
                .long("mode")
                .takes_value(true)
                .default_value("run-now")
                .possible_values(&["test-only", "run-now", "will-run"])
                .help("planner mode to exercise"),
        )
        .get_matches();

    let node_count: usize = matches.value_of("nodes").unwrap().parse().expect("nodes must be a number");
    let cpus: u32 = matches.value_of("cpus").unwrap().parse().expect("cpus must be a number");
    let min_cpus: u32 = matches.value_of("min-cpus").unwrap().parse().expect("min-cpus must be a number");
    let min_nodes: u32 = matches.value_of("min-nodes").unwrap().parse().expect("min-nodes must be a number");
    let contiguous = matches.is_present("contiguous");
    let mode = match matches.value_of("mode").unwrap() {
        "test-only" => SelectMode::TestOnly,
        "run-now" => SelectMode::RunNow,
        "will-run" => SelectMode::WillRun,
        other => unreachable!("clap restricted this to known values, got {other}"),
    };

    let nodes = synthetic_nodes(node_count, cpus, 16_384);
    let partitions = vec![PartitionRecord {
        id: 0,
        name: "default".to_string(),
        node_bitmap: Bitmap::from_indices(node_count, 0..node_count),
        max_share: 1,
    }];

    let core = SelectCore::new(CoreConfig::default(), Box::new(NullGresService), Box::new(LllpProcsOracle));
    core.node_init(nodes, partitions, Vec::new());

    let details = JobDetails {
        min_cpus,
        min_nodes,
        required_node_bitmap: None,
        excluded_node_bitmap: None,
        contiguous,
        shared: false,
        pn_min_memory: 0,
        cpus_per_task: 1,
        ntasks_per_node: 0,
        multi_core: None,
    };
    let mut job = JobRecord::new(1, 0, details);
    let mut candidates = Bitmap::from_indices(node_count, 0..node_count);
    let preempt_candidates: Vec<PreemptCandidate> = Vec::new();

    match core.job_test(&mut job, &mut candidates, min_nodes, u32::MAX, min_nodes, mode, &preempt_candidates, 0) {
        Ok(preemptees) => {
            println!("mode: {mode:?}");
            println!("selected nodes: {:?}", candidates.iter_set().collect::<Vec<_>>());
            println!("job.total_cpus: {}", job.total_cpus);
            println!("job.start_time: {}", job.start_time);
            if !preemptees.is_empty() {
                println!("preempted jobs: {preemptees:?}");
            }
        }
        Err(e) => {
            eprintln!("job_test failed: {e}");
            std::process::exit(1);
        }
    }
}
