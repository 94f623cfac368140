//! Components compiled into the engine, registered under the `builtin` module.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use anyhow::Result;
use tonearm_types::{ComponentKind, PCM_PACKET_PERIOD, packet_frames};

use crate::component::{ComponentBody, ComponentContext, PcmSource, StreamOutput};
use crate::registry::StaticLibrary;
use crate::sync::{lock, wait, wait_timeout};
use crate::worker::Worker;

pub const BUILTIN_MODULE: &str = "builtin";
pub const NULL_OUTPUT: &str = "null";

/// Sample rate assumed while the buffer reports no format.
const FALLBACK_RATE: u32 = 44_100;

pub fn library() -> StaticLibrary {
    StaticLibrary::new(BUILTIN_MODULE).component(
        NULL_OUTPUT,
        ComponentKind::StreamOutput,
        |ctx| Ok(ComponentBody::StreamOutput(Box::new(NullOutput::new(ctx)))),
    )
}

#[derive(Default)]
struct Flags {
    running: bool,
    paused: bool,
}

#[derive(Default)]
struct NullShared {
    flags: Mutex<Flags>,
    changed: Condvar,
}

/// Discards PCM at the real-time rate of whatever is buffered.
pub struct NullOutput {
    ctx: Arc<ComponentContext>,
    shared: Arc<NullShared>,
    worker: Option<Worker>,
}

impl NullOutput {
    pub fn new(ctx: Arc<ComponentContext>) -> Self {
        Self {
            ctx,
            shared: Arc::new(NullShared::default()),
            worker: None,
        }
    }

    fn set_paused(&self, paused: bool) {
        lock(&self.shared.flags).paused = paused;
        self.shared.changed.notify_all();
    }
}

fn drain(shared: Arc<NullShared>, pcm: Arc<dyn PcmSource>) {
    loop {
        {
            let mut flags = lock(&shared.flags);
            while flags.running && flags.paused {
                flags = wait(&shared.changed, flags);
            }
            if !flags.running {
                break;
            }
        }

        let rate = match pcm.pcm_format().sample_rate {
            0 => FALLBACK_RATE,
            rate => rate,
        };
        let pulled = packet_frames(&pcm.pull_packet(PCM_PACKET_PERIOD));
        let period = Duration::from_secs_f64(pulled.max(PCM_PACKET_PERIOD) as f64 / rate as f64);

        let flags = lock(&shared.flags);
        if !flags.running {
            break;
        }
        drop(wait_timeout(&shared.changed, flags, period));
    }
}

impl StreamOutput for NullOutput {
    fn start_playback(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        *lock(&self.shared.flags) = Flags {
            running: true,
            paused: false,
        };
        let shared = self.shared.clone();
        let pcm = self.ctx.pcm_source();
        self.worker = Some(
            self.ctx
                .runtime()
                .spawn("tonearm-null-output", move || drain(shared, pcm)),
        );
        tracing::debug!(component = %self.ctx.name(), "null output started");
        Ok(())
    }

    fn stop_playback(&mut self) -> Result<()> {
        lock(&self.shared.flags).running = false;
        self.shared.changed.notify_all();
        if let Some(worker) = self.worker.take() {
            worker.join();
            tracing::debug!(component = %self.ctx.name(), "null output stopped");
        }
        Ok(())
    }

    fn pause_playback(&mut self) -> Result<()> {
        self.set_paused(true);
        Ok(())
    }

    fn resume_playback(&mut self) -> Result<()> {
        self.set_paused(false);
        Ok(())
    }
}

impl Drop for NullOutput {
    fn drop(&mut self) {
        let _ = self.stop_playback();
    }
}
