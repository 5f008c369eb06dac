//! End-to-end runs over small synthetic data.

use ndarray::{Array1, Array2, Axis};

use hebbscope::checkpoint::{load_model, Checkpoint, LayerMapping};
use hebbscope::data::{DataLoader, Dataset, ImageShape};
use hebbscope::evaluator::{Evaluator, EvaluatorConfig, HebbianEvaluator};
use hebbscope::krotov::{HebbianConfig, HebbianEngine};
use hebbscope::layers::Mode;
use hebbscope::model::{Model, ModelSpec};
use hebbscope::prng::Prng;
use hebbscope::recorder::{ActivationRecord, ActivationRecorder};
use hebbscope::select::select;
use hebbscope::visualize::{Visualizer, VisualizerConfig};

/// 4x4 images, class 0 lights the top half and class 1 the bottom half.
fn halves(n: usize, seed: u64) -> Dataset {
    let mut rng = Prng::new(seed);
    let labels: Vec<usize> = (0..n).map(|i| i % 2).collect();
    let images = Array2::from_shape_fn((n, 16), |(i, j)| {
        let on = (j < 8) == (labels[i] == 0);
        let base = if on { 0.9 } else { 0.05 };
        base + rng.gen_range_f32(0.0, 0.05)
    });
    Dataset::new(images, labels, ImageShape::new(1, 4, 4)).unwrap()
}

fn small_model(seed: u64) -> Model {
    Model::from_spec(&ModelSpec::fc1(&[16, 8], 1.5, true).with_classes(2).with_seed(seed)).unwrap()
}

#[test]
fn reference_network_shapes() {
    let mut model = Model::from_spec(&ModelSpec::default()).unwrap();
    let names: Vec<&str> = model.layer_names().collect();
    assert_eq!(names, vec!["linear1", "batch_norm", "repu", "linear2"]);

    let mut rng = Prng::new(2);
    let x = Array2::from_shape_simple_fn((16, 784), || rng.next_f32_01());
    let trace = model.forward_traced(x, Mode::Eval, &["repu"]).unwrap();
    assert_eq!(trace.output.dim(), (16, 10));
    assert_eq!(trace.tap("repu").unwrap().dim(), (16, 2000));
}

#[test]
fn evaluator_reports_best_of_ten_checkpoints() {
    let ds = halves(32, 1);
    let loader = DataLoader::new(ds, 8, true, 3).unwrap();
    let mut model = small_model(4);
    let linear1_before = model.layer_state("linear1").unwrap();

    let cfg = EvaluatorConfig::default().with_lr(0.01);
    assert_eq!((cfg.epochs, cfg.eval_every), (100, 10));
    let mut evaluator = HebbianEvaluator::new(loader, cfg);
    let report = evaluator.run(&mut model).unwrap();

    let history = evaluator.history();
    assert_eq!(history.len(), 10);
    assert_eq!(
        history.iter().map(|p| p.epoch).collect::<Vec<_>>(),
        (1..=10).map(|k| k * 10).collect::<Vec<_>>()
    );
    let min_loss = history.iter().map(|p| p.loss).fold(f32::INFINITY, f32::min);
    let max_acc = history.iter().map(|p| p.accuracy).fold(f32::NEG_INFINITY, f32::max);
    assert_eq!(report.loss, min_loss);
    assert_eq!(report.acc, max_acc);
    assert!((0.0..=1.0).contains(&report.acc));
    assert!(report.acc > 0.8);

    assert_eq!(model.trainable_layers(), vec!["linear2"]);
    assert_eq!(model.layer_state("linear1").unwrap(), linear1_before);
}

#[test]
fn selection_on_a_recorded_batch() {
    let mut rng = Prng::new(37);
    let mut values = Array2::<f32>::from_shape_simple_fn((16, 2000), || -rng.next_f32_01());
    for mut row in values.axis_iter_mut(Axis(0)) {
        let mut idx: Vec<usize> = (0..2000).collect();
        rng.shuffle(&mut idx);
        for &i in &idx[..37] {
            row[i] = 0.01 + rng.next_f32_01();
        }
        // Zero is not above the cutoff.
        row[idx[37]] = 0.0;
    }
    let record = ActivationRecord {
        layer: "repu".into(),
        pass: 1,
        values,
    };

    for i in 0..record.batch_len() {
        let row = record.example(i).unwrap();
        let sel = select(row, 0.0);
        assert_eq!(sel.len(), 37);
        assert!(sel.values.windows(2).all(|w| w[0] >= w[1]));
        assert!(sel.iter().all(|(unit, v)| row[unit] == v && v > 0.0));
    }
    assert!(record.example(16).is_err());
}

#[test]
fn pretrained_checkpoint_restores_into_a_fresh_model() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("hebbian.hbck");

    let mut loader = DataLoader::new(halves(24, 5), 6, true, 1).unwrap();
    let mut model = small_model(6);
    let engine = HebbianEngine::new(HebbianConfig::default().with_epochs(3)).unwrap();
    engine.init_weights(&mut model).unwrap();
    engine.train(&mut model, &mut loader).unwrap();
    Checkpoint::from_model(&model).save(&path).unwrap();

    let restored = load_model(&path, None, &[LayerMapping::same("linear1")]).unwrap();
    assert_eq!(restored.spec(), model.spec());
    assert_eq!(restored.layer_state("linear1").unwrap(), model.layer_state("linear1").unwrap());
    let fresh = Model::from_spec(model.spec().unwrap()).unwrap();
    assert_ne!(fresh.layer_state("linear1").unwrap(), model.layer_state("linear1").unwrap());

    let renamed: LayerMapping = "linear1=linear1".parse().unwrap();
    assert_eq!(renamed, LayerMapping::same("linear1"));
    assert!(load_model(&path, None, &[LayerMapping::same("missing")]).is_err());
}

#[test]
fn recorded_activations_drive_the_renderer() {
    let dir = tempfile::tempdir().unwrap();
    let ds = halves(4, 8);
    let mut model = small_model(9);
    // Keep weight energy under the filter threshold.
    let w = model.linear("linear1").unwrap().weight_matrix().unwrap().mapv(|v| v * 0.1);
    model.linear_mut("linear1").unwrap().set_weight_matrix(w).unwrap();

    let mut recorder = ActivationRecorder::attach(&model, "repu").unwrap();
    let out = recorder.forward(&mut model, ds.images.clone(), Mode::Eval).unwrap();
    assert_eq!(out.dim(), (4, 2));
    let record = recorder.take().unwrap();
    assert_eq!(record.values.dim(), (4, 8));

    let vis = Visualizer::new(
        VisualizerConfig::default()
            .with_annotate(false)
            .with_out_dir(dir.path()),
    );
    let weights = model.linear("linear1").unwrap().weight_matrix().unwrap();
    let mut rendered = 0;
    for i in 0..ds.len() {
        let acts = record.example(i).unwrap();
        let expected = acts.iter().filter(|&&v| v > 0.0).count();
        match vis.visualize_example(i, ds.image(i), acts, weights, ds.shape) {
            Ok(art) => {
                assert_eq!(art.selection.len(), expected);
                assert_eq!(art.overlays.len(), art.grid.slice.len());
                assert!(art.input.exists());
                rendered += 1;
            }
            Err(hebbscope::error::HebbError::EmptySelection(_)) => assert_eq!(expected, 0),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    // RePU after batch norm leaves about half the units active.
    assert!(rendered > 0);

    let zeros = Array1::<f32>::zeros(8);
    assert!(vis
        .visualize_example(99, ds.image(0), zeros.view(), weights, ds.shape)
        .is_err());
}
