use cogrnn::{Rnn, Trainer};
use cogtasks::tools::ei_labels;
use cogtasks::{experiment, EXPERIMENTS};

#[test]
fn default_configs_are_valid() {
    for name in EXPERIMENTS {
        let exp = experiment(name).unwrap();
        assert_eq!(exp.name(), name);

        let trainer = Trainer::new(exp.config()).unwrap();
        assert!(trainer.config.ei.is_some());
        assert_eq!(trainer.config.n_out, 2);
    }

    assert!(experiment("stroop").is_none());
}

#[test]
fn short_training_runs_end_to_end() {
    for name in EXPERIMENTS {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(format!("{name}.sav"));
        let exp = experiment(name).unwrap();

        let mut config = exp.config();
        config.n = 20;
        config.ei = Some(ei_labels(20, 0.8));
        config.dt = Some(50.);
        config.n_gradient = 2;
        config.n_validation = 4;
        config.checkfreq = Some(1);
        config.max_iter = 2;

        let report = Trainer::new(config)
            .unwrap()
            .train(&path, exp.task(), false)
            .unwrap();

        let state = &report.checkpoint.state;
        assert_eq!(state.costs_history.len(), state.performance_history.len());
        assert!(state.performance_history.iter().all(|p| (0. ..=1.).contains(p)));

        let rnn = Rnn::load(&path).unwrap();
        let (trial, run) = rnn.run_trial(exp.task(), 1, true).unwrap();
        assert_eq!(run.z.dim(), (trial.len(), 2));
    }
}
