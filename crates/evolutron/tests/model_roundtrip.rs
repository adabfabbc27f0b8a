//! Model wrapper: training, evaluation, persistence and artifact handles.

use candle_core::{Device, Tensor};
use evolutron::building_blocks::featurize::{encode, secs_to_hot, SecSScheme};
use evolutron::config::TrainConfig;
use evolutron::models::architecture::LayerParam;
use evolutron::utils::data_handling::to_batch_tensor;
use evolutron::utils::stats::MetricKind;
use evolutron::{ArchitectureSpec, Handle, ModelInterface, SeqNetModel};

const LENGTH: usize = 12;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn small_spec() -> ArchitectureSpec {
    ArchitectureSpec {
        nb_filter: LayerParam::Scalar(4),
        nb_categories: 3,
        dropout: 0.1,
        ..ArchitectureSpec::new(LENGTH, 20, 3)
    }
}

fn toy_data() -> (Tensor, Tensor) {
    let pairs = [
        ("MKVLATWAG", "HHHHEEECC"),
        ("ACDEFGHIKL", "CCHHHHEEEC"),
        ("WWYYMMKK", "EEEEHHHH"),
        ("LLLLAAAACC", "HHHHHHCCCC"),
    ];
    let xs: Vec<_> = pairs.iter().map(|(s, _)| encode(s, 20).unwrap()).collect();
    let ys: Vec<_> = pairs
        .iter()
        .map(|(_, l)| secs_to_hot(l, SecSScheme::ThreeClass).unwrap())
        .collect();
    let x = to_batch_tensor(&xs.iter().collect::<Vec<_>>(), LENGTH, &Device::Cpu).unwrap();
    let y = to_batch_tensor(&ys.iter().collect::<Vec<_>>(), LENGTH, &Device::Cpu).unwrap();
    (x, y)
}

// ---------------------------------------------------------------------------
// Training
// ---------------------------------------------------------------------------

#[test]
fn fit_records_every_step_and_evaluates() {
    init_logging();
    let mut model = SeqNetModel::from_options(small_spec(), "secs", Device::Cpu).unwrap();
    let (x, y) = toy_data();
    let config = TrainConfig {
        batch_size: 2,
        epochs: 2,
        seed: Some(7),
        ..Default::default()
    };

    let history = model.fit(&x, &y, &config).unwrap();
    // two batches per epoch
    assert_eq!(history.len(), 4);
    assert!(history.losses.iter().all(|l| l.is_finite()));

    let report = model.evaluate(&x, &y, 3).unwrap();
    assert!(report.loss.is_finite());
    let accuracy = report
        .get(MetricKind::CategoricalAccuracy)
        .and_then(|v| v.as_scalar())
        .unwrap();
    assert!((0.0..=1.0).contains(&accuracy));
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[test]
fn save_then_load_predicts_identically() {
    init_logging();
    let dir = std::env::temp_dir().join("evolutron_it_roundtrip");
    let mut model = SeqNetModel::from_options(small_spec(), "secs", Device::Cpu).unwrap();
    let handle = model.handle("toy", 0).unwrap();
    let weights = model.save_to_handle(&dir, &handle).unwrap();
    assert!(weights.exists());
    assert!(SeqNetModel::descriptor_path(&weights).exists());

    let (x, _) = toy_data();
    let before: Vec<Vec<Vec<f32>>> = model.predict(&x).unwrap().to_vec3().unwrap();

    let mut reloaded = SeqNetModel::load_from_handle(&dir, &handle, Device::Cpu).unwrap();
    let after: Vec<Vec<Vec<f32>>> = reloaded.predict(&x).unwrap().to_vec3().unwrap();
    std::fs::remove_dir_all(&dir).ok();

    assert_eq!(reloaded.spec(), model.spec());
    assert_eq!(before, after);
}

#[test]
fn loading_against_a_different_architecture_fails() {
    init_logging();
    let dir = std::env::temp_dir().join("evolutron_it_mismatch");
    let weights = dir.join("model.safetensors");
    let model = SeqNetModel::from_options(small_spec(), "secs", Device::Cpu).unwrap();
    model.save(&weights).unwrap();

    // overwrite the descriptor's spec with a wider network
    let descriptor_path = SeqNetModel::descriptor_path(&weights);
    let text = std::fs::read_to_string(&descriptor_path).unwrap();
    let mut json: serde_json::Value = serde_json::from_str(&text).unwrap();
    json["spec"]["nb_filter"] = serde_json::json!(6);
    std::fs::write(&descriptor_path, json.to_string()).unwrap();

    let result = SeqNetModel::load(&weights, Device::Cpu);
    std::fs::remove_dir_all(&dir).ok();
    assert!(result.is_err());
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

#[test]
fn handle_renders_and_parses() {
    let handle = Handle::new("cullpdb", 100, 3, 10, 1, 0, "seq_net", "arch.json").unwrap();
    let path = handle.to_string();
    assert_eq!(path, "cullpdb/100_3_10_1_0_seq_net.arch.json");
    assert_eq!(path.parse::<Handle>().unwrap(), handle);
    assert!("cullpdb/100_3_x_1_0_m.h5".parse::<Handle>().is_err());
}
