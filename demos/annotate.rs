use linux_perf_import::{import_perf, ImportOptions};

fn main() {
    let path = std::env::args()
        .nth(1)
        .expect("Usage: annotate <perf.data>");

    let profile = match import_perf(&path, ImportOptions::default()) {
        Ok(profile) => profile,
        Err(e) => {
            eprintln!("ERROR importing {path}: {e}");
            std::process::exit(1);
        }
    };

    let mut counters: Vec<_> = profile.counters.iter().collect();
    counters.sort();
    println!("Counters:");
    for (name, count) in counters {
        println!("  {name}: {count}");
    }
    println!();

    let mut functions: Vec<_> = profile.functions.iter().collect();
    functions.sort_by_key(|(name, _)| name.as_str());
    for (name, function) in functions {
        println!("{name}: {:?}", function.counters);
        for line in &function.data {
            if line.counters.is_empty() {
                println!("  {:>16x}: {}", line.pc, line.text);
            } else {
                println!("  {:>16x}: {}  {:?}", line.pc, line.text, line.counters);
            }
        }
        println!();
    }
}
