//! Initialization logic for a generic instance of the `Transport` trait.
//!
//! A `Configuration` describes *how many* workers/processes participate and
//! *where* they are,
//! `try_build` turns that into concrete transport instances, and
//! `initialize_from` spawns one worker thread per instance and returns
//! `WorkerGuards` the caller joins to collect results.

use std::any::Any;
#[cfg(feature = "getopts")]
use std::io::BufRead;
use std::sync::Arc;
use std::thread;

use crate::generic::Generic;
use crate::process::Process;
use crate::tcp::{self, Tcp};
use crate::thread::Thread;

/// Possible configurations for the transport infrastructure.
pub enum Configuration {
    /// A single worker, single process.
    Thread,
    /// One process hosting the given number of worker threads.
    Process(usize),
    /// Multiple processes: `(threads_per_process, this_process_index, addresses)`.
    Cluster(usize, usize, Vec<String>),
}

#[cfg(feature = "getopts")]
impl Configuration {
    /// Parses a `Configuration` from command-line-style arguments, using the
    /// conventional `-w`/`-p`/`-n`/`-h` flag shape.
    pub fn from_args<I: Iterator<Item = String>>(args: I) -> Result<Configuration, String> {
        let mut opts = getopts::Options::new();
        opts.optopt("w", "threads", "number of per-process worker threads", "NUM");
        opts.optopt("p", "process", "identity of this process", "IDX");
        opts.optopt("n", "processes", "number of processes", "NUM");
        opts.optopt("h", "hostfile", "text file whose lines are process addresses", "FILE");

        let matches = opts.parse(args).map_err(|e| format!("{e:?}"))?;

        let threads: usize = matches.opt_str("w").map(|x| x.parse().unwrap_or(1)).unwrap_or(1);
        let process: usize = matches.opt_str("p").map(|x| x.parse().unwrap_or(0)).unwrap_or(0);
        let processes: usize = matches.opt_str("n").map(|x| x.parse().unwrap_or(1)).unwrap_or(1);

        if process >= processes {
            return Err(format!("process index {process} out of range for {processes} processes"));
        }

        if processes > 1 {
            let mut addresses = Vec::new();
            if let Some(hosts) = matches.opt_str("h") {
                let file = std::fs::File::open(&hosts).map_err(|e| format!("{e}"))?;
                for line in std::io::BufReader::new(file).lines().take(processes) {
                    addresses.push(line.map_err(|e| format!("{e}"))?);
                }
                if addresses.len() < processes {
                    return Err(format!("only read {} addresses from {hosts}, need {processes}", addresses.len()));
                }
            } else {
                for index in 0..processes {
                    addresses.push(format!("127.0.0.1:{}", 2101 + index));
                }
            }
            Ok(Configuration::Cluster(threads, process, addresses))
        } else if threads > 1 {
            Ok(Configuration::Process(threads))
        } else {
            Ok(Configuration::Thread)
        }
    }
}

impl Configuration {
    /// Assembles the described transport infrastructure.
    ///
    /// Returns one transport per local worker thread, plus an opaque
    /// `Box<dyn Any>` of resources (e.g. joined reader-thread guards) that
    /// must outlive the computation.
    pub fn try_build(self) -> Result<(Vec<Generic>, Box<dyn Any>), String> {
        match self {
            Configuration::Thread => Ok((vec![Generic::Thread(Thread::new())], Box::new(()))),
            Configuration::Process(threads) => {
                let built = Process::new_vector(threads).into_iter().map(Generic::Process).collect();
                Ok((built, Box::new(())))
            }
            Configuration::Cluster(threads, process, addresses) => {
                if threads != 1 {
                    return Err("multi-threaded cluster processes are not yet supported; use threads=1 per process".to_owned());
                }
                let sockets = tcp::connect(&addresses, process).map_err(|e| format!("{e}"))?;
                let transport = Tcp::new(process, addresses.len(), sockets);
                Ok((vec![Generic::Tcp(transport)], Box::new(())))
            }
        }
    }
}

/// Allocates one transport per worker thread and spawns the supplied
/// closure on each, returning join guards for the results.
pub fn initialize<T, F>(config: Configuration, func: F) -> Result<WorkerGuards<T>, String>
where
    T: Send + 'static,
    F: Fn(Generic) -> T + Send + Sync + 'static,
{
    let (transports, others) = config.try_build()?;
    initialize_from(transports, others, func)
}

/// As [`initialize`], but from an explicit list of transports (e.g. built by
/// a caller who wants finer control than [`Configuration`] offers).
pub fn initialize_from<T, F>(
    transports: Vec<Generic>,
    resources: Box<dyn Any>,
    func: F,
) -> Result<WorkerGuards<T>, String>
where
    T: Send + 'static,
    F: Fn(Generic) -> T + Send + Sync + 'static,
{
    let logic = Arc::new(func);
    let mut guards = Vec::new();
    for (index, transport) in transports.into_iter().enumerate() {
        let logic = logic.clone();
        let handle = thread::Builder::new()
            .name(format!("cnc-worker-{index}"))
            .spawn(move || (*logic)(transport))
            .map_err(|e| format!("{e:?}"))?;
        guards.push(handle);
    }
    Ok(WorkerGuards { guards, _resources: resources })
}

/// Join handles for the worker threads an [`initialize`] call spawned.
pub struct WorkerGuards<T: Send + 'static> {
    guards: Vec<thread::JoinHandle<T>>,
    _resources: Box<dyn Any>,
}

impl<T: Send + 'static> WorkerGuards<T> {
    /// Waits for every worker thread and collects its result.
    pub fn join(mut self) -> Vec<Result<T, String>> {
        self.guards
            .drain(..)
            .map(|guard| guard.join().map_err(|e| format!("{e:?}")))
            .collect()
    }
}

impl<T: Send + 'static> Drop for WorkerGuards<T> {
    fn drop(&mut self) {
        for guard in self.guards.drain(..) {
            let _ = guard.join();
        }
    }
}
