extern crate getopts;
use getopts::Options;
use std::{env, process};

use cogrnn::{logging, Config, Rnn, Trainer};
use cogtasks::{experiment, Experiment, EXPERIMENTS};
use ndarray::Axis;
use tracing::info;

const TEST_TRIALS: u64 = 100;

struct Args {
    task: Box<dyn Experiment>,
    savefile: String,
    config: Option<String>,
    fresh: bool,
    run: bool,
}

fn parse_args() -> Args {
    fn print_usage(program: &str, opts: Options) {
        let brief = format!("Usage: {} -t TASK [options]", program);
        print!("{}", opts.usage(&brief));
    }

    let args = env::args().collect::<Vec<String>>();
    let program = args[0].clone();
    let mut opts = Options::new();

    opts.optopt("t", "task", "Task to train", &EXPERIMENTS.join("|"));
    opts.optopt("o", "output", "Checkpoint file", "/path/to/task.sav");
    opts.optopt("f", "file", "Configuration file", "/path/to/task.cfg.json");
    opts.optflag(
        "g",
        "generate-config",
        "Write the task's default config at your current path.",
    );
    opts.optflag("", "fresh", "Start over instead of recovering from the checkpoint.");
    opts.optflag("", "run", "Run the trained network on test trials.");
    opts.optflag("h", "help", "Print this help.");

    let matches = match opts.parse(&args[1..]) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("{}", e);
            print_usage(&program, opts);
            process::exit(1);
        }
    };

    if matches.opt_present("h") {
        print_usage(&program, opts);
        process::exit(0);
    }

    let task = match matches.opt_str("t").as_deref().map(experiment) {
        Some(Some(task)) => task,
        Some(None) => {
            eprintln!("unknown task, expected one of {}", EXPERIMENTS.join(", "));
            process::exit(1);
        }
        None => {
            print_usage(&program, opts);
            process::exit(0);
        }
    };

    if matches.opt_present("g") {
        let path = format!("./{}.cfg.json", task.name());
        if let Err(e) = task.config().dump(&path) {
            eprintln!("failed to write config: {}", e);
            process::exit(1);
        }

        println!("wrote {}", path);
        process::exit(0);
    }

    Args {
        savefile: matches
            .opt_str("o")
            .unwrap_or_else(|| format!("./{}.sav", task.name())),
        task,
        config: matches.opt_str("f"),
        fresh: matches.opt_present("fresh"),
        run: matches.opt_present("run"),
    }
}

fn train(args: &Args) -> cogrnn::Result<()> {
    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => args.task.config(),
    };

    let mut trainer = Trainer::new(config)?;
    let report = trainer.train(&args.savefile, args.task.task(), !args.fresh)?;

    info!(
        stop = ?report.stop,
        iteration = report.checkpoint.state.iteration,
        best_error = report.checkpoint.state.best_error,
        savefile = %args.savefile,
        "done"
    );

    Ok(())
}

fn run(args: &Args) -> cogrnn::Result<()> {
    let rnn = Rnn::load(&args.savefile)?;
    let task = args.task.task();

    for (name, value) in rnn.settings.iter() {
        println!("{:<34} {}", name, value);
    }
    println!("{:<34} {:.3}", "spectral radius", rnn.spectral_radius()?);

    let mut scored = 0;
    let mut total = 0.;
    for seed in 0..TEST_TRIALS {
        let (trial, result) = rnn.run_trial(task, seed, true)?;
        let z = result.z.insert_axis(Axis(1));

        if let Some(p) = task.performance(std::slice::from_ref(&trial), &z) {
            total += p;
            scored += 1;
        }
    }

    match scored {
        0 => println!("task defines no performance measure"),
        n => println!("performance on {} test trials: {:.1}%", n, 100. * total / n as f64),
    }

    Ok(())
}

fn main() {
    logging::init("info");
    let args = parse_args();

    let result = match args.run {
        true => run(&args),
        false => train(&args),
    };

    if let Err(e) = result {
        eprintln!("({}) failed with error: {}", args.task.name(), e);
        process::exit(1);
    }
}
