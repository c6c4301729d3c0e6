use std::path::PathBuf;
use std::str::FromStr;
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use blockviz_core::{
    calculate_hash, mine, Block, ChainState, Engine, EngineConfig, Payload, Transaction,
};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "blockviz")]
#[command(about = "Drive the blockviz chain integrity engine from the command line")]
struct Cli {
    /// JSON engine config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Hash attempts between mining yields
    #[arg(long, global = true)]
    batch_size: Option<u64>,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Hash a set of block fields
    Hash {
        #[arg(long, default_value_t = 0)]
        index: u64,
        /// Milliseconds since the epoch
        #[arg(long, default_value_t = 0)]
        timestamp: u64,
        /// Text payload
        #[arg(long)]
        data: String,
        #[arg(long, default_value = "0")]
        previous_hash: String,
        #[arg(long, default_value_t = 0)]
        nonce: u64,
    },
    /// Mine a standalone block and report the winning nonce
    Mine {
        #[arg(long)]
        data: String,
        #[arg(long, default_value_t = 2)]
        difficulty: u32,
        #[arg(long, default_value_t = 1)]
        index: u64,
        #[arg(long, default_value = "0")]
        previous_hash: String,
        /// Defaults to now
        #[arg(long)]
        timestamp: Option<u64>,
        /// Search on all cores instead of the cooperative miner
        #[arg(long)]
        parallel: bool,
    },
    /// Append, mine, then edit a block, printing the flags after each step
    Demo {
        #[arg(long, default_value_t = 2)]
        difficulty: u32,
        #[arg(long, default_value = "hello")]
        data: String,
        #[arg(long, default_value = "world")]
        edit: String,
    },
    /// Apply steps in order and print the final chain state.
    ///
    /// Steps: append:TEXT, tx:FROM,TO,AMOUNT[;FROM,TO,AMOUNT...], mine:N,
    /// edit:N=TEXT, reorder:FROM,TO, difficulty:N, select:N|none,
    /// revalidate, reset
    Run {
        #[arg(required = true)]
        steps: Vec<Step>,
    },
}

#[derive(Clone, Debug, PartialEq)]
enum Step {
    Append(Payload),
    Mine(usize),
    Edit(usize, String),
    Reorder(usize, usize),
    Difficulty(u32),
    Select(Option<usize>),
    Revalidate,
    Reset,
}

fn parse_transactions(raw: &str) -> Result<Vec<Transaction>> {
    raw.split(';')
        .map(|part| {
            let fields: Vec<&str> = part.split(',').collect();
            let [from, to, amount] = fields.as_slice() else {
                bail!("transaction {part:?} must be FROM,TO,AMOUNT");
            };
            let amount = Transaction::parse_amount(amount)
                .ok_or_else(|| anyhow!("amount in {part:?} must be a number above zero"))?;
            Ok(Transaction::new(from.trim(), to.trim(), amount))
        })
        .collect()
}

impl FromStr for Step {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (name, arg) = s.split_once(':').unwrap_or((s, ""));
        let index = |raw: &str| -> Result<usize> {
            raw.trim()
                .parse()
                .with_context(|| format!("bad block index {raw:?}"))
        };
        let step = match name {
            "append" => Step::Append(Payload::from(arg)),
            "tx" => Step::Append(Payload::from(parse_transactions(arg)?)),
            "mine" => Step::Mine(index(arg)?),
            "edit" => {
                let (i, text) = arg
                    .split_once('=')
                    .ok_or_else(|| anyhow!("edit expects N=TEXT"))?;
                Step::Edit(index(i)?, text.to_string())
            }
            "reorder" => {
                let (from, to) = arg
                    .split_once(',')
                    .ok_or_else(|| anyhow!("reorder expects FROM,TO"))?;
                Step::Reorder(index(from)?, index(to)?)
            }
            "difficulty" => Step::Difficulty(
                arg.trim()
                    .parse()
                    .with_context(|| format!("bad difficulty {arg:?}"))?,
            ),
            "select" if arg == "none" => Step::Select(None),
            "select" => Step::Select(Some(index(arg)?)),
            "revalidate" => Step::Revalidate,
            "reset" => Step::Reset,
            other => bail!("unknown step {other:?}"),
        };
        Ok(step)
    }
}

#[derive(Serialize)]
struct MineReport {
    index: u64,
    nonce: u64,
    hash: String,
    difficulty: u32,
    time_ms: u128,
    hash_rate: f64,
}

#[derive(Serialize)]
struct DemoStep {
    step: String,
    is_valid_chain: bool,
    block: Block,
}

#[derive(Serialize)]
struct RunReport {
    state: ChainState,
    rejected: Vec<String>,
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_path(path)?,
        None => EngineConfig::default(),
    };
    if let Some(batch_size) = cli.batch_size {
        config.batch_size = batch_size;
    }
    config.validate()?;
    Ok(config)
}

async fn mine_standalone(block: Block, batch_size: u64, parallel: bool) -> Result<MineReport> {
    let start = Instant::now();
    let difficulty = block.difficulty;
    let mined = if parallel {
        mine::mine_parallel(block)?
    } else {
        let cancel = CancellationToken::new();
        mine::mine(block, batch_size, &cancel, |nonce, _| {
            info!("still mining, next nonce {nonce}");
        })
        .await?
    };

    let time_ms = start.elapsed().as_millis();
    let attempts = (mined.nonce + 1) as f64;
    let hash_rate = if time_ms > 0 {
        attempts / (time_ms as f64 / 1000.0)
    } else {
        attempts
    };
    Ok(MineReport {
        index: mined.index,
        nonce: mined.nonce,
        hash: mined.hash,
        difficulty,
        time_ms,
        hash_rate,
    })
}

async fn run_demo(engine: &Engine, difficulty: u32, data: String, edit: String) -> Result<Vec<DemoStep>> {
    let mut steps = Vec::new();
    let mut record = |step: String| {
        let state = engine.snapshot();
        if let Some(block) = state.blocks.get(1) {
            steps.push(DemoStep {
                step,
                is_valid_chain: state.is_valid_chain,
                block: block.clone(),
            });
        }
    };

    engine.set_difficulty(difficulty);
    engine.append(data.clone());
    record(format!("append {data:?}"));
    engine.start_mining(1)?.wait().await?;
    record("mine 1".to_string());
    engine.update_data(1, edit.clone())?;
    record(format!("edit 1 -> {edit:?}"));
    engine.revalidate();
    record("revalidate".to_string());
    Ok(steps)
}

async fn run_steps(engine: &Engine, steps: Vec<Step>) -> Result<RunReport> {
    let mut rejected = Vec::new();
    for step in steps {
        let outcome = match &step {
            Step::Append(payload) => {
                engine.append(payload.clone());
                Ok(())
            }
            Step::Mine(index) => match engine.start_mining(*index) {
                Ok(handle) => handle.wait().await.map(|_| ()),
                Err(e) => Err(e),
            },
            Step::Edit(index, text) => engine.update_data(*index, text.as_str()),
            Step::Reorder(from, to) => engine.reorder(*from, *to),
            Step::Difficulty(difficulty) => {
                engine.set_difficulty(*difficulty);
                Ok(())
            }
            Step::Select(index) => {
                engine.select(*index);
                Ok(())
            }
            Step::Revalidate => {
                engine.revalidate();
                Ok(())
            }
            Step::Reset => {
                engine.reset();
                Ok(())
            }
        };
        if let Err(e) = outcome {
            warn!("step {step:?} rejected: {e}");
            rejected.push(format!("{step:?}: {e}"));
        }
    }
    Ok(RunReport {
        state: engine.snapshot(),
        rejected,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.cmd {
        Command::Hash {
            index,
            timestamp,
            data,
            previous_hash,
            nonce,
        } => {
            let hash = calculate_hash(index, timestamp, &Payload::from(data), &previous_hash, nonce);
            println!("{hash}");
        }
        Command::Mine {
            data,
            difficulty,
            index,
            previous_hash,
            timestamp,
            parallel,
        } => {
            let mut block = Block::new(0, index, Payload::from(data), previous_hash, difficulty);
            if let Some(ts) = timestamp {
                block.timestamp = ts;
            }
            let report = mine_standalone(block, config.batch_size, parallel).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Demo {
            difficulty,
            data,
            edit,
        } => {
            let engine = Engine::new(config);
            let steps = run_demo(&engine, difficulty, data, edit).await?;
            println!("{}", serde_json::to_string_pretty(&steps)?);
        }
        Command::Run { steps } => {
            let engine = Engine::new(config);
            let report = run_steps(&engine, steps).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_steps() {
        assert_eq!("append:hello".parse::<Step>().unwrap(), Step::Append(Payload::from("hello")));
        assert_eq!("mine:2".parse::<Step>().unwrap(), Step::Mine(2));
        assert_eq!(
            "edit:1=world".parse::<Step>().unwrap(),
            Step::Edit(1, "world".into())
        );
        assert_eq!("reorder:3,1".parse::<Step>().unwrap(), Step::Reorder(3, 1));
        assert_eq!("difficulty:4".parse::<Step>().unwrap(), Step::Difficulty(4));
        assert_eq!("select:none".parse::<Step>().unwrap(), Step::Select(None));
        assert_eq!("select:2".parse::<Step>().unwrap(), Step::Select(Some(2)));
        assert_eq!("revalidate".parse::<Step>().unwrap(), Step::Revalidate);
        assert_eq!("reset".parse::<Step>().unwrap(), Step::Reset);
    }

    #[test]
    fn parse_transaction_step() {
        let step: Step = "tx:Alice,Bob,10;Bob,Carol,0.25".parse().unwrap();
        let Step::Append(Payload::Transactions(txs)) = step else {
            panic!("expected a transactions payload");
        };
        assert_eq!(txs.len(), 2);
        assert_eq!(txs[0].from, "Alice");
        assert_eq!(txs[0].amount, 10.0);
        assert_eq!(txs[1].to, "Carol");
        assert_eq!(txs[1].amount, 0.25);
    }

    #[test]
    fn parse_rejects_malformed_steps() {
        assert!("mine:x".parse::<Step>().is_err());
        assert!("edit:1".parse::<Step>().is_err());
        assert!("reorder:1".parse::<Step>().is_err());
        assert!("tx:Alice,Bob".parse::<Step>().is_err());
        assert!("tx:Alice,Bob,0".parse::<Step>().is_err());
        assert!("tx:Alice,Bob,-1.5".parse::<Step>().is_err());
        assert!("fork:1".parse::<Step>().is_err());
    }

    #[tokio::test]
    async fn run_steps_records_rejections() {
        let engine = Engine::default();
        let steps = vec![
            Step::Difficulty(0),
            Step::Append(Payload::from("a")),
            Step::Reorder(0, 1),
            Step::Mine(9),
        ];
        let report = run_steps(&engine, steps).await.unwrap();
        assert_eq!(report.state.len(), 2);
        assert_eq!(report.rejected.len(), 2);
    }
}
