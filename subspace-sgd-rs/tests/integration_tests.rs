//! End-to-end runs of the three drivers through [`Trainer`].

use candle_core::Device;
use subspace_sgd_rs::config::{BlendConfig, DataSource, SampleStrategy};
use subspace_sgd_rs::dataset::SyntheticClusters;
use subspace_sgd_rs::metrics::{RunLog, LOSS, TEST_ACCURACY};
use subspace_sgd_rs::trainer::Phase;
use subspace_sgd_rs::{Algorithm, ExperimentConfig, RunSummary, SubspaceError, Trainer};
use tempfile::TempDir;

fn small_config(results_dir: &std::path::Path) -> ExperimentConfig {
    let mut config = ExperimentConfig::default()
        .with_epochs(3)
        .with_results_dir(results_dir)
        .with_progress(false);
    config.model.hidden_dims = vec![16];
    config.model.num_classes = 3;
    config.data.source = DataSource::Synthetic {
        train_samples: 96,
        test_samples: 48,
        input_dim: 6,
        noise: 0.5,
    };
    config.data.batch_size = 16;
    config
}

#[test]
fn test_sgd_then_psgd_pipeline() {
    let tmp = TempDir::new().unwrap();
    let sgd_config = small_config(tmp.path());

    let mut trainer = Trainer::new(sgd_config.clone()).unwrap();
    let sgd = trainer.train().unwrap();
    assert_eq!(sgd.algorithm, Algorithm::Sgd);
    assert_eq!(sgd.epochs.len(), 3);
    // init + 2 per epoch
    assert_eq!(sgd.samples_taken, 7);
    let sample_dir = sgd.sample_dir.clone().unwrap();
    assert!(sample_dir.ends_with("Mlp-SGD-lr0.1-per-epoch-f2"));

    // the summary lands next to the samples
    let saved = RunSummary::load(tmp.path().join("Mlp-SGD-lr0.1.json")).unwrap();
    assert_eq!(saved.samples_taken, 7);

    let mut psgd_config = sgd_config.with_algorithm(Algorithm::Psgd).with_epochs(2);
    psgd_config.subspace.samples = 6;
    psgd_config.subspace.dim = 4;
    psgd_config.subspace.sample_dir = Some(sample_dir);

    let mut trainer = Trainer::new(psgd_config).unwrap();
    let psgd = trainer.train().unwrap();
    assert_eq!(psgd.run_name, "Mlp-PSGD-lr0.1-d4-s6");
    assert_eq!(psgd.pca_seconds.len(), 1);
    assert!(psgd.epochs.iter().all(|e| e.phase == Phase::Psgd));
    assert!(psgd.final_evaluation().unwrap().loss.is_finite());
}

#[test]
fn test_second_sgd_run_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let config = small_config(tmp.path()).with_epochs(1);

    Trainer::new(config.clone()).unwrap().train().unwrap();
    let err = Trainer::new(config).unwrap().train().unwrap_err();
    assert!(matches!(err, SubspaceError::RunExists(_)));
}

#[test]
fn test_bsgd_alternates_phases() {
    let tmp = TempDir::new().unwrap();
    let mut config = small_config(tmp.path())
        .with_algorithm(Algorithm::Bsgd)
        .with_epochs(7);
    config.blend = BlendConfig::default()
        .with_sgd_epochs(3)
        .with_psgd_epochs(1)
        .with_window(5)
        .with_dim(3);

    let mut trainer = Trainer::new(config).unwrap();
    let summary = trainer.train().unwrap();

    let phases: Vec<Phase> = summary.epochs.iter().map(|e| e.phase).collect();
    assert_eq!(
        phases,
        [
            Phase::Sgd,
            Phase::Sgd,
            Phase::Sgd,
            Phase::Psgd,
            Phase::Sgd,
            Phase::Sgd,
            Phase::Sgd
        ]
    );
    assert_eq!(summary.pca_seconds.len(), 1);
    assert!(summary.sample_dir.is_none());

    let history = trainer.run_log().history();
    assert_eq!(history.values(TEST_ACCURACY).len(), 7);
    // 6 minibatches per epoch
    assert_eq!(history.values(LOSS).len(), 42);
}

#[test]
fn test_interval_sampling_through_config() {
    let tmp = TempDir::new().unwrap();
    let mut config = small_config(tmp.path()).with_epochs(2);
    config.sampling.strategy = SampleStrategy::Interval;
    config.sampling.frequency = 4;

    let summary = Trainer::new(config).unwrap().train().unwrap();
    // 12 steps, every 4th sampled, plus the initialisation
    assert_eq!(summary.samples_taken, 4);
    assert!(summary
        .sample_dir
        .unwrap()
        .ends_with("Mlp-SGD-lr0.1-interval-f4"));
}

#[test]
fn test_safetensors_dataset_source() {
    let tmp = TempDir::new().unwrap();
    let generator = SyntheticClusters {
        input_dim: 5,
        num_classes: 3,
        noise: 0.4,
        seed: 3,
    };
    let train_path = tmp.path().join("train.safetensors");
    let test_path = tmp.path().join("test.safetensors");
    generator
        .generate(40, 0, &Device::Cpu)
        .unwrap()
        .save_safetensors(&train_path)
        .unwrap();
    generator
        .generate(20, 1, &Device::Cpu)
        .unwrap()
        .save_safetensors(&test_path)
        .unwrap();

    let mut config = small_config(tmp.path()).with_epochs(1);
    config.data.source = DataSource::Safetensors {
        train_path,
        test_path,
    };

    let summary = Trainer::new(config).unwrap().train().unwrap();
    // 5 input features, 16 hidden, 3 classes
    assert_eq!(summary.num_params, 5 * 16 + 16 + 16 * 3 + 3);
}

#[test]
fn test_metrics_sink_receives_run() {
    let tmp = TempDir::new().unwrap();
    let config = small_config(tmp.path()).with_epochs(1);
    let metrics_path = tmp.path().join("metrics.jsonl");

    let log = RunLog::new()
        .with_sink(subspace_sgd_rs::metrics::JsonLinesSink::create(&metrics_path).unwrap());
    let mut trainer = Trainer::new(config).unwrap().with_run_log(log);
    trainer.train().unwrap();

    let content = std::fs::read_to_string(&metrics_path).unwrap();
    // 6 losses, epoch time, test loss, test accuracy
    assert_eq!(content.lines().count(), 9);
    assert!(content.contains("epoch time consumption"));
}
