use clap::Parser as ClapParser;
use std::process;

use shapevm::{
    CodeBlockId, EvaluationError, GetByIdState, PutByIdState, VM, VMSettings, demos,
};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Demo programs to run, all of them when empty
    #[arg(required = false, help = "Names of the demos to run")]
    demos: Vec<String>,

    /// Loop count for demos that take one
    #[arg(long, default_value_t = 1_000)]
    iterations: u32,

    /// Register file capacity in slots
    #[arg(long)]
    register_file: Option<usize>,

    /// Terminate scripts after this many safepoint ticks
    #[arg(long)]
    tick_limit: Option<u64>,

    /// List the demos and exit
    #[arg(long)]
    list: bool,

    /// Print per-site cache state after each demo
    #[arg(long, help = "Dump inline cache state of the demo program")]
    dump_caches: bool,

    #[arg(short, long, help = "Log at debug level")]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    env_logger::Builder::from_default_env()
        .filter_level(if cli.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Warn
        })
        .init();

    if cli.list {
        for demo in &demos::DEMOS {
            println!("{:<12} {}", demo.name, demo.description);
        }
        return;
    }

    let selected: Vec<&demos::Demo> = if cli.demos.is_empty() {
        demos::DEMOS.iter().collect()
    } else {
        cli.demos
            .iter()
            .map(|name| match demos::find(name) {
                Some(demo) => demo,
                None => {
                    eprintln!("Unknown demo '{name}', try --list");
                    process::exit(2);
                }
            })
            .collect()
    };

    let mut settings = VMSettings {
        watchdog_tick_limit: cli.tick_limit,
        ..VMSettings::default()
    };
    if let Some(capacity) = cli.register_file {
        settings.register_file_capacity = capacity;
    }

    for demo in selected {
        let mut vm = match VM::new(settings.clone()) {
            Ok(vm) => vm,
            Err(err) => {
                eprintln!("Invalid settings: {err}");
                process::exit(2);
            }
        };
        println!("== {} ==", demo.name);
        let code = (demo.build)(cli.iterations);
        let code_block = match vm.link_code_block(&code) {
            Ok(code_block) => code_block,
            Err(err) => {
                eprintln!("Error linking {}: {}", demo.name, EvaluationError::from(err));
                process::exit(1);
            }
        };
        match vm.run_program(code_block) {
            Ok(value) => println!("result: {}", vm.display_value(value)),
            Err(uncaught) => {
                let what = if uncaught.terminated { "terminated" } else { "uncaught" };
                println!("{what}: {}", vm.display_value(uncaught.value));
                println!("frames unwound: {}", uncaught.frames_unwound);
            }
        }
        if !vm.last_exception_stack.is_empty() {
            println!("last exception stack:");
            for frame in &vm.last_exception_stack {
                println!("    {frame}");
            }
        }
        if cli.dump_caches {
            dump_caches(&vm, code_block);
        }
        println!("{:?}", vm.stats);
        println!("{:?}", vm.heap.stats());
    }
}

fn dump_caches(vm: &VM, code_block: CodeBlockId) {
    let code = vm.code_block(code_block);
    for (site, cache) in code.get_by_id.iter().enumerate() {
        let state = match cache.state() {
            GetByIdState::Uninitialized => "uninitialized".to_string(),
            GetByIdState::Monomorphic(_) => "monomorphic".to_string(),
            GetByIdState::Polymorphic(list) => format!("polymorphic({})", list.len()),
            GetByIdState::Generic => "generic".to_string(),
        };
        println!("get_by_id#{site}: {state} {:?}", cache.counters);
    }
    for (site, cache) in code.put_by_id.iter().enumerate() {
        let state = match cache.state() {
            PutByIdState::Uninitialized => "uninitialized".to_string(),
            PutByIdState::Monomorphic(_) => "monomorphic".to_string(),
            PutByIdState::Polymorphic(list) => format!("polymorphic({})", list.len()),
            PutByIdState::Generic => "generic".to_string(),
        };
        println!("put_by_id#{site}: {state} {:?}", cache.counters);
    }
    for (site, cache) in code.resolve.iter().enumerate() {
        println!(
            "resolve#{site}: {} op(s), {} recomputation(s), hits {}, slow {}",
            cache.operations.len(),
            cache.recomputations,
            cache.hits,
            cache.slow_path
        );
    }
    for (site, info) in code.calls.iter().enumerate() {
        println!(
            "call#{site}: {:?} hits {}, slow {}",
            info.state(),
            info.hits,
            info.slow_path_count
        );
    }
}
