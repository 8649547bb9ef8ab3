use matgraph::back::cpu::CpuBackend;
use matgraph::back::Backend;
use matgraph::{ContextConfig, Graph, GraphClient, Init, NodeSpec, NodeType::*};
use once_cell::sync::Lazy;

static LOGGER: Lazy<()> = Lazy::new(|| {
    let _ = env_logger::builder().is_test(true).try_init();
});

const X: [f32; 8] = [0.0, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0];
const E: [f32; 4] = [0.0, 1.0, 1.0, 0.0];
const LR: f32 = 0.05;

fn xor<B: Backend>(g: &mut Graph<B>) {
    let mut node = |name: &str, w, h, t, init| {
        g.create_node(name, NodeSpec::new(w, h, t), Some(init)).unwrap();
    };
    node("X", 2, 4, Input, Init::Data(X.to_vec()));
    node("W1", 3, 2, Train, Init::Random);
    node("B1", 3, 1, Train, Init::Random);
    node("H", 3, 4, Intermediate, Init::Zero);
    node("R", 3, 4, Intermediate, Init::Zero);
    node("W2", 1, 3, Train, Init::Random);
    node("B2", 1, 1, Train, Init::Random);
    node("Y", 1, 4, Output, Init::Zero);
    node("E", 1, 4, Input, Init::Data(E.to_vec()));
    g.multiply_add("X", "W1", "B1", "H").unwrap();
    g.relu("H", "R").unwrap();
    g.multiply_add("R", "W2", "B2", "Y").unwrap();
    g.add_loss_pair("Y", "E").unwrap();
}

fn window_means(losses: &[f32], window: usize) -> Vec<f32> {
    losses
        .chunks(window)
        .map(|w| w.iter().sum::<f32>() / w.len() as f32)
        .collect()
}

#[test]
fn test_xor_loss_decreases() {
    Lazy::force(&LOGGER);
    let mut g = Graph::seeded(CpuBackend::new(), 7);
    xor(&mut g);

    let mut losses = vec![];
    for _ in 0..1000 {
        g.forward().unwrap();
        losses.push(g.loss_value().unwrap());
        g.backward_and_add_gradient(LR).unwrap();
    }

    let means = window_means(&losses, 100);
    for pair in means.windows(2) {
        assert!(pair[1] <= pair[0] + 1e-3, "loss went up: {means:?}");
    }
    assert!(means[means.len() - 1] < 0.9 * means[0], "{means:?}");
}

#[test]
fn test_same_seed_same_training() {
    let run = || {
        let mut g = Graph::seeded(CpuBackend::new(), 21);
        xor(&mut g);
        for _ in 0..50 {
            g.forward().unwrap();
            g.backward_and_add_gradient(LR).unwrap();
        }
        g.forward().unwrap();
        g.values("Y").unwrap()
    };
    assert_eq!(run(), run());
}

#[test]
fn test_xor_through_the_client() {
    Lazy::force(&LOGGER);
    let c = GraphClient::spawn(ContextConfig::cpu().with_seed(7)).unwrap();
    pollster::block_on(c.wait_for_ready()).unwrap();

    let node = |name: &str, w, h, t, init| {
        c.create_node(name, NodeSpec::new(w, h, t), Some(init)).unwrap();
    };
    node("X", 2, 4, Input, Init::Data(X.to_vec()));
    node("W1", 3, 2, Train, Init::Random);
    node("B1", 3, 1, Train, Init::Random);
    node("H", 3, 4, Intermediate, Init::Zero);
    node("R", 3, 4, Intermediate, Init::Zero);
    node("W2", 1, 3, Train, Init::Random);
    node("B2", 1, 1, Train, Init::Random);
    node("Y", 1, 4, Output, Init::Zero);
    node("E", 1, 4, Input, Init::Data(E.to_vec()));
    c.multiply_add("X", "W1", "B1", "H").unwrap();
    c.relu("H", "R").unwrap();
    c.multiply_add("R", "W2", "B2", "Y").unwrap();
    c.loss("Y", "E").unwrap();

    let output = || {
        c.forward().unwrap();
        pollster::block_on(c.get_values("Y")).unwrap().values
    };
    let loss = |y: &[f32]| {
        y.iter()
            .zip(E)
            .map(|(a, e)| 0.5 * (a - e).powi(2))
            .sum::<f32>()
    };

    let before = loss(&output());
    for _ in 0..300 {
        c.forward().unwrap();
        c.backward_and_add_gradient(LR).unwrap();
    }
    pollster::block_on(c.finish()).unwrap();
    let y = output();
    let after = loss(&y);
    assert!(after < before, "{before} -> {after}");
    assert!(c.take_errors().is_empty());

    // Same seed and same commands as the in-process run
    let mut g = Graph::seeded(CpuBackend::new(), 7);
    xor(&mut g);
    for _ in 0..300 {
        g.forward().unwrap();
        g.backward_and_add_gradient(LR).unwrap();
    }
    g.forward().unwrap();
    assert_eq!(g.values("Y").unwrap(), y);
}
