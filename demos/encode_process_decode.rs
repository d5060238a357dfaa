//! Encode-process-decode training on random graphs
//!
//! Demonstrates: dataset → batching → prime → optimizer → train/eval loop
//!
//! Run with:
//! ```bash
//! cargo run --example encode_process_decode
//! ```

use an_graph_nets::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;

fn main() -> Result<()> {
    let device = best_device();
    let mut rng = StdRng::seed_from_u64(2);

    // 1. Random graphs with "features" inputs and "target" labels in [1, 10)
    let graph_config = RandomGraphConfig {
        min_nodes: 2,
        max_nodes: 12,
        node_dims: (3, 1),
        edge_dims: (2, 1),
        global_dims: (1, 1),
        ..Default::default()
    };
    let dataset = random_dataset(&graph_config, 100, &mut rng)?;
    // widths from the whole dataset, so batches without edges keep them
    let input_widths = dataset.feature_widths("features");
    let target_widths = dataset.feature_widths("target");
    let n_train = dataset.len() * 9 / 10;
    let (train_set, test_set) = dataset.random_split(n_train, &mut rng)?;

    // 2. Model with a regression decoder
    let model = EncodeProcessDecode::from_config(&EncodeProcessDecodeConfig {
        latent_size: 16,
        hidden_sizes: vec![16],
        ..Default::default()
    })?;
    let learning = LearningConfig {
        learning_rate: 0.005,
        num_steps: 5,
        batch_size: 16,
        epochs: 10,
        ..Default::default()
    };

    // 3. Prime the deferred transforms so every parameter exists
    let first = dataset
        .get(0)
        .ok_or_else(|| GraphNetError::Configuration("empty dataset".into()))?;
    let primer = to_graph_tuple_with_widths(&[first], "features", &input_widths, &device)?;
    println!("Priming with {}", primer.shape());
    model.forward(&primer, 1)?;

    let mut optimizer = Optimizer::new(model.trainable_vars(), &learning)?;
    println!(
        "Training with {} parameters ({} vars)",
        model.param_count(),
        model.trainable_vars().len()
    );

    // 4. Training loop
    let loss_fn = GraphTupleLoss::new(LossKind::Mse);
    let mut loader = GraphDataLoader::new(&train_set, learning.batch_size).with_shuffle(7);
    let mut test_loader = GraphDataLoader::new(&test_set, learning.batch_size);
    let mut tracker = MetricsTracker::new();
    let mut step = 0;

    println!("\n--- Training ---");
    for epoch in 0..learning.epochs {
        for batch in loader.epoch() {
            let input = to_graph_tuple_with_widths(&batch, "features", &input_widths, &device)?;
            let target = to_graph_tuple_with_widths(&batch, "target", &target_widths, &device)?;

            let result =
                train_step(&model, &mut optimizer, &input, &target, &loss_fn, &learning, step)?;
            if result.skipped {
                println!("  step {}: skipped (non-finite gradients)", step);
            }
            tracker.record(&result);
            step += 1;
        }

        let mut test_loss = 0.0f32;
        for batch in test_loader.epoch() {
            let input = to_graph_tuple_with_widths(&batch, "features", &input_widths, &device)?;
            let target = to_graph_tuple_with_widths(&batch, "target", &target_widths, &device)?;
            let outputs = model.forward(&input, learning.num_steps)?;
            if let Some(last) = outputs.last() {
                test_loss += loss_fn.compute(last, &target)?.to_scalar::<f32>()?;
            }
        }

        println!(
            "  epoch {:3}: train_loss={:.4}, test_loss={:.4}",
            epoch,
            tracker.average_loss(loader.num_batches()).unwrap_or(f32::NAN),
            test_loss
        );
    }

    println!(
        "\nBest training loss: {:.4} over {} steps ({} skipped)",
        tracker.best_loss().unwrap_or(f32::NAN),
        tracker.total_steps(),
        tracker.skipped_steps()
    );
    Ok(())
}
