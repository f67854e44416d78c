// Randomised power-cut soak test for RAFS
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use bytes::Bytes;
use clap::{Arg, Command};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rafs::{
    Config, FormatKind, OpenMode, Rafs, RafsError, RafsMessage, RamPartition, RamPartitionManager,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const PARTITION: &str = "/VMdl";
const BLOCK: u32 = 4096;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_max_level(tracing::Level::WARN).init();

    let matches = Command::new("power-cut-soak")
        .version("0.1.0")
        .about("Random workloads with random power cuts against an in-memory flash")
        .arg(
            Arg::new("iterations")
                .long("iterations")
                .help("Operations to run")
                .default_value("2000"),
        )
        .arg(
            Arg::new("seed")
                .long("seed")
                .help("Random seed, picked from entropy when omitted"),
        )
        .arg(
            Arg::new("blocks")
                .long("blocks")
                .help("Partition size in 4 KiB blocks")
                .default_value("64"),
        )
        .get_matches();

    let iterations: usize = matches
        .get_one::<String>("iterations")
        .context("missing iterations")?
        .parse()
        .context("Invalid iteration count")?;
    let blocks: u32 = matches
        .get_one::<String>("blocks")
        .context("missing blocks")?
        .parse()
        .context("Invalid block count")?;
    let seed: u64 = match matches.get_one::<String>("seed") {
        Some(seed) => seed.parse().context("Invalid seed")?,
        None => rand::random(),
    };

    println!("Power-cut soak: {} operations on {} blocks, seed {}", iterations, blocks, seed);

    let mut soak = Soak::new(seed, blocks)?;
    let mut results = SoakResults::new();
    for i in 0..iterations {
        let outcome = soak.iteration(i).await;
        results.record(&outcome);
        if let Outcome::Failed { op, reason } = outcome {
            results.generate_report();
            bail!("Iteration {} ({:?}) broke the file system: {}", i, op, reason);
        }
    }

    results.generate_report();
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Op {
    Create,
    Remove,
    Compact,
}

#[derive(Debug)]
enum Outcome {
    Completed { op: Op, duration: Duration },
    Interrupted { op: Op, duration: Duration },
    Skipped { op: Op },
    Failed { op: Op, reason: String },
}

struct Soak {
    rng: StdRng,
    part: RamPartition,
    files: BTreeMap<String, Vec<u8>>,
    next_name: u32,
}

impl Soak {
    fn new(seed: u64, blocks: u32) -> anyhow::Result<Self> {
        let part = RamPartition::new(BLOCK, blocks);
        let mut fs = instance(&part);
        fs.format(PARTITION, FormatKind::Normal)?;
        Ok(Self {
            rng: StdRng::seed_from_u64(seed),
            part,
            files: BTreeMap::new(),
            next_name: 0,
        })
    }

    fn pick_op(&mut self) -> Op {
        match self.rng.gen_range(0..10) {
            0..=5 => Op::Create,
            6..=8 => Op::Remove,
            _ => Op::Compact,
        }
    }

    async fn iteration(&mut self, i: usize) -> Outcome {
        let op = self.pick_op();
        let cut = self.rng.gen_bool(0.5).then(|| self.rng.gen_range(0..40));
        debug!("Iteration {}: {:?}, cut after {:?}", i, op, cut);

        let mut driver = match Driver::mount(&self.part).await {
            Ok(driver) => driver,
            Err(e) => {
                return Outcome::Failed {
                    op,
                    reason: format!("mount: {}", e),
                }
            }
        };

        let start = Instant::now();
        if let Some(ops) = cut {
            self.part.cut_power_after(ops);
        }
        let pending = match op {
            Op::Create => self.create(&mut driver).await,
            Op::Remove => self.remove(&mut driver).await,
            Op::Compact => driver.compact().await.map(|_| None),
        };
        let duration = start.elapsed();
        let interrupted = self.part.power_lost();
        self.part.restore_power();
        drop(driver);

        let pending = match pending {
            Ok(Some(pending)) => pending,
            Ok(None) => Pending::Nothing,
            Err(Skip) => return Outcome::Skipped { op },
        };

        if let Err(reason) = self.verify(pending).await {
            return Outcome::Failed { op, reason };
        }
        if interrupted {
            Outcome::Interrupted { op, duration }
        } else {
            Outcome::Completed { op, duration }
        }
    }

    async fn create(&mut self, driver: &mut Driver) -> Result<Option<Pending>, Skip> {
        let room = match driver.fs.statfs(PARTITION) {
            Ok(stat) => stat.file_space as usize,
            Err(_) => return Err(Skip),
        };
        if room == 0 {
            return Err(Skip);
        }
        let len = self.rng.gen_range(0..=room.min(6 * BLOCK as usize));
        let mut data = vec![0u8; len];
        self.rng.fill(&mut data[..]);

        let name = format!("S{}", self.next_name);
        self.next_name += 1;
        match driver.put(&name, Bytes::from(data.clone())).await {
            Ok(()) => {
                self.files.insert(name, data);
                Ok(None)
            }
            Err(RafsError::FileSystemFull) => Err(Skip),
            Err(e) => {
                debug!("Create of {} interrupted: {}", name, e);
                Ok(Some(Pending::MaybeCreated(name, data)))
            }
        }
    }

    async fn remove(&mut self, driver: &mut Driver) -> Result<Option<Pending>, Skip> {
        if self.files.is_empty() {
            return Err(Skip);
        }
        let pick = self.rng.gen_range(0..self.files.len());
        let Some(name) = self.files.keys().nth(pick).cloned() else {
            return Err(Skip);
        };
        match driver.remove(&name).await {
            Ok(()) => {
                self.files.remove(&name);
                Ok(None)
            }
            Err(e) => {
                debug!("Remove of {} interrupted: {}", name, e);
                Ok(Some(Pending::MaybeRemoved(name)))
            }
        }
    }

    /// Remount and compare every file against the model.
    async fn verify(&mut self, pending: Pending) -> Result<(), String> {
        let mut driver = Driver::mount(&self.part)
            .await
            .map_err(|e| format!("remount: {}", e))?;

        match pending {
            Pending::Nothing => {}
            Pending::MaybeCreated(name, data) => match driver.get(&name) {
                Ok(found) if found == data => {
                    self.files.insert(name, data);
                }
                Ok(found) => {
                    return Err(format!(
                        "{} holds {} bytes, expected {}",
                        name,
                        found.len(),
                        data.len()
                    ))
                }
                Err(RafsError::FileNotFound) => {}
                Err(e) => return Err(format!("{}: {}", name, e)),
            },
            Pending::MaybeRemoved(name) => match driver.get(&name) {
                Ok(_) => {}
                Err(RafsError::FileNotFound) => {
                    self.files.remove(&name);
                }
                Err(e) => return Err(format!("{}: {}", name, e)),
            },
        }

        for (name, data) in &self.files {
            match driver.get(name) {
                Ok(found) if &found == data => {}
                Ok(found) => {
                    return Err(format!(
                        "{} changed: {} bytes, expected {}",
                        name,
                        found.len(),
                        data.len()
                    ))
                }
                Err(e) => return Err(format!("{} unreadable: {}", name, e)),
            }
        }

        let stat = driver.fs.statfs(PARTITION).map_err(|e| format!("statfs: {}", e))?;
        if stat.num_dir_entries as usize != self.files.len() {
            return Err(format!(
                "{} directory entries, expected {}",
                stat.num_dir_entries,
                self.files.len()
            ));
        }
        driver.fs.unmount(PARTITION).map_err(|e| format!("unmount: {}", e))
    }
}

/// Effect of an interrupted operation that is only known after remount.
enum Pending {
    Nothing,
    MaybeCreated(String, Vec<u8>),
    MaybeRemoved(String),
}

struct Skip;

fn instance(part: &RamPartition) -> Rafs<RamPartitionManager> {
    let mut manager = RamPartitionManager::new();
    manager.insert("VMdl", part.clone());
    Rafs::init(manager, Config::default())
}

/// One mounted instance plus its completion channel.
struct Driver {
    fs: Rafs<RamPartitionManager>,
    tx: rafs::Responder,
    rx: mpsc::UnboundedReceiver<RafsMessage>,
}

impl Driver {
    async fn mount(part: &RamPartition) -> Result<Self, RafsError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut driver = Self {
            fs: instance(part),
            tx,
            rx,
        };
        driver.fs.mount(Some(driver.tx.clone()), PARTITION)?;
        match driver.completion().await {
            Some(RafsMessage::MountComplete { status }) => status?,
            other => warn!("Unexpected mount completion {:?}", other),
        }
        Ok(driver)
    }

    async fn completion(&mut self) -> Option<RafsMessage> {
        loop {
            if let Ok(message) = self.rx.try_recv() {
                return Some(message);
            }
            if !self.fs.step() {
                return None;
            }
            tokio::task::yield_now().await;
        }
    }

    async fn put(&mut self, name: &str, data: Bytes) -> Result<(), RafsError> {
        let path = format!("{}/{}", PARTITION, name);
        let file = self.fs.open(Some(self.tx.clone()), &path, OpenMode::Write)?;
        self.fs.write_background(file, data)?;
        let written = match self.completion().await {
            Some(RafsMessage::WriteComplete(done)) => done.result,
            other => {
                warn!("Unexpected write completion {:?}", other);
                Err(RafsError::BadId)
            }
        };
        let closed = self.fs.close(file);
        written.and(closed)
    }

    fn get(&mut self, name: &str) -> Result<Vec<u8>, RafsError> {
        let path = format!("{}/{}", PARTITION, name);
        let file = self.fs.open(None, &path, OpenMode::Read)?;
        let mut out = Vec::new();
        let mut buf = vec![0u8; BLOCK as usize];
        let read = loop {
            match self.fs.read(file, &mut buf) {
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(RafsError::NoMoreData) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        self.fs.close(file)?;
        read.map(|()| out)
    }

    async fn remove(&mut self, name: &str) -> Result<(), RafsError> {
        let path = format!("{}/{}", PARTITION, name);
        self.fs.remove(Some(self.tx.clone()), &path)?;
        match self.completion().await {
            Some(RafsMessage::RemoveComplete { status }) => status,
            other => {
                warn!("Unexpected remove completion {:?}", other);
                Ok(())
            }
        }
    }

    async fn compact(&mut self) -> Result<(), Skip> {
        match self.fs.compact(Some(self.tx.clone()), PARTITION) {
            Ok(()) => {}
            Err(RafsError::FileSystemClean) => return Err(Skip),
            Err(e) => {
                debug!("Compaction refused: {}", e);
                return Ok(());
            }
        }
        match self.completion().await {
            Some(RafsMessage::CompactComplete { status, free_slots }) => {
                debug!("Compaction finished {:?}, {} free slots", status, free_slots);
            }
            other => warn!("Unexpected compaction completion {:?}", other),
        }
        Ok(())
    }
}

struct SoakResults {
    counts: BTreeMap<(Op, &'static str), usize>,
    slowest: Duration,
    start_time: Instant,
}

impl SoakResults {
    fn new() -> Self {
        Self {
            counts: BTreeMap::new(),
            slowest: Duration::ZERO,
            start_time: Instant::now(),
        }
    }

    fn record(&mut self, outcome: &Outcome) {
        let (op, label, duration) = match outcome {
            Outcome::Completed { op, duration } => (*op, "completed", Some(*duration)),
            Outcome::Interrupted { op, duration } => (*op, "interrupted", Some(*duration)),
            Outcome::Skipped { op } => (*op, "skipped", None),
            Outcome::Failed { op, .. } => (*op, "failed", None),
        };
        *self.counts.entry((op, label)).or_default() += 1;
        if let Some(duration) = duration {
            self.slowest = self.slowest.max(duration);
        }
    }

    fn generate_report(&self) {
        println!("\nRAFS Power-Cut Soak Report");
        println!("{}", "=".repeat(40));
        for ((op, label), count) in &self.counts {
            println!("  {:<8} {:<12} {}", format!("{:?}", op), label, count);
        }
        println!("  Slowest operation: {:?}", self.slowest);
        println!("  Total duration: {:?}", self.start_time.elapsed());
        info!("Soak finished after {:?}", self.start_time.elapsed());
    }
}
