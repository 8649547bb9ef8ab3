use log::{info, warn};
use matgraph::back::cpu::CpuBackend;
use matgraph::proto::worker::{self, Handler};
use matgraph::proto::{wire, Command, Request, Response};
use matgraph::{ContextConfig, ErrorKind, Graph, GraphClient, Init, NodeSpec, NodeType, Result};
use std::io::{BufRead, Write};
use std::sync::mpsc::channel;

const XOR_INPUT: [f32; 8] = [0.0, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0];
const XOR_EXPECTED: [f32; 4] = [0.0, 1.0, 1.0, 0.0];
const LEARNING_RATE: f32 = 0.05;

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    let res = match args.get(1).map(String::as_str) {
        None | Some("serve") => serve(),
        Some("--xor") => match args.get(2).map(|s| s.parse::<usize>()) {
            None => xor(2000),
            Some(Ok(steps)) => xor(steps),
            Some(Err(e)) => Err(ErrorKind::Config(format!("bad step count: {e}")).into()),
        },
        Some("--dot") => dot(),
        Some("--help") | Some("-h") => {
            print_usage();
            Ok(())
        }
        Some(other) => {
            eprintln!("unknown argument {other:?}");
            print_usage();
            std::process::exit(2);
        }
    };

    if let Err(e) = res {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn print_usage() {
    println!("USAGE:");
    println!("  matgraph [serve]       Read JSON commands from stdin, one per line");
    println!("  matgraph --xor [N]     Train the XOR network for N steps (default 2000)");
    println!("  matgraph --dot         Print the XOR network as a graphviz digraph");
    println!();
    println!("ENVIRONMENT:");
    println!("  MATGRAPH_BACKEND       cpu (default) or wgpu");
    println!("  MATGRAPH_SEED          seed for random initialization");
    println!("  RUST_LOG               log filter, logs go to stderr");
}

/// Answer JSON command lines on stdin with JSON response lines on stdout.
fn serve() -> Result<()> {
    let config = ContextConfig::from_env()?;
    let (req_tx, req_rx) = channel();
    let (resp_tx, resp_rx) = channel();
    let worker = worker::spawn(config, req_rx, resp_tx.clone())?;

    let writer = std::thread::spawn(move || {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        for r in resp_rx.iter() {
            if writeln!(out, "{}", wire::encode(&r))
                .and_then(|_| out.flush())
                .is_err()
            {
                break;
            }
        }
    });

    let stdin = std::io::stdin();
    let mut input = stdin.lock();
    let mut line = Vec::new();
    loop {
        line.clear();
        match input.read_until(b'\n', &mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("reading stdin: {e}");
                break;
            }
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let sent = match wire::decode_bytes(&line) {
            Ok(req) => req_tx.send(req).is_ok(),
            Err(e) => {
                warn!("rejected message: {}", e.message);
                resp_tx.send(Response::Error(e)).is_ok()
            }
        };
        if !sent {
            break;
        }
    }

    drop(req_tx);
    let _ = worker.join();
    drop(resp_tx);
    let _ = writer.join();
    info!("input closed");
    Ok(())
}

/// 2-3-1 network: `Y = relu(X * W1 + B1) * W2 + B2`, trained against `E`.
fn xor_commands() -> Vec<Command> {
    use NodeType::*;
    let node = |name: &str, w, h, t, init| Command::CreateNode {
        name: name.into(),
        spec: NodeSpec::new(w, h, t),
        initialization: Some(init),
    };
    vec![
        node("X", 2, 4, Input, Init::Data(XOR_INPUT.to_vec())),
        node("W1", 3, 2, Train, Init::Random),
        node("B1", 3, 1, Train, Init::Random),
        node("H", 3, 4, Intermediate, Init::Zero),
        node("R", 3, 4, Intermediate, Init::Zero),
        node("W2", 1, 3, Train, Init::Random),
        node("B2", 1, 1, Train, Init::Random),
        node("Y", 1, 4, Output, Init::Zero),
        node("E", 1, 4, Input, Init::Data(XOR_EXPECTED.to_vec())),
        Command::MultiplyAdd {
            x: "X".into(),
            w: "W1".into(),
            b: "B1".into(),
            y: "H".into(),
        },
        Command::Relu {
            x: "H".into(),
            y: "R".into(),
        },
        Command::MultiplyAdd {
            x: "R".into(),
            w: "W2".into(),
            b: "B2".into(),
            y: "Y".into(),
        },
        Command::Loss {
            actual: "Y".into(),
            expected: "E".into(),
        },
    ]
}

fn loss(actual: &[f32]) -> f32 {
    actual
        .iter()
        .zip(XOR_EXPECTED)
        .map(|(a, e)| 0.5 * (a - e).powi(2))
        .sum()
}

fn xor(steps: usize) -> Result<()> {
    let client = GraphClient::spawn(ContextConfig::from_env()?)?;
    pollster::block_on(client.wait_for_ready())?;
    for c in xor_commands() {
        client.submit(c)?;
    }

    for step in 0..=steps {
        client.forward()?;
        if step % 100 == 0 || step == steps {
            let y = pollster::block_on(client.get_values("Y"))?;
            info!("step {step}: loss {:.6}", loss(&y.values));
        }
        if step < steps {
            client.backward_and_add_gradient(LEARNING_RATE)?;
        }
    }
    pollster::block_on(client.finish())?;

    if let Some(e) = client.take_errors().into_iter().next() {
        return Err(ErrorKind::Remote {
            command: e.command.unwrap_or_default(),
            message: e.message,
        }
        .into());
    }

    let y = pollster::block_on(client.get_values("Y"))?;
    for (input, out) in XOR_INPUT.chunks(2).zip(&y.values) {
        println!("{input:?} -> {out:.4}");
    }
    Ok(())
}

fn dot() -> Result<()> {
    let mut ctx = worker::Context::new(Graph::seeded(CpuBackend::new(), 0));
    for c in xor_commands() {
        if let Response::Error(e) = ctx.handle(Request::new(c, None)) {
            return Err(ErrorKind::Remote {
                command: e.command.unwrap_or_default(),
                message: e.message,
            }
            .into());
        }
    }
    println!("{}", ctx.graph().to_dot());
    Ok(())
}
