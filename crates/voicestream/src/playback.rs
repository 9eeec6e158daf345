use crate::output::{AudioOutput, OutputClock};
use crate::types::SharedAudioData;
use rodio::{OutputStreamBuilder, Sink};
use std::sync::mpsc;
use std::thread::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("Failed to initialize audio output stream")]
    InitFailed,
    #[error("Failed to create audio sink")]
    FailedToCreateAudioSink,
}

enum DeviceCommand {
    Append(SharedAudioData),
    Pause,
    Play,
    Clear,
    Shutdown,
}

/// Output to the default audio device.
///
/// The rodio stream and sink live on a dedicated thread; the sink plays
/// appended buffers back to back, which is exactly the gapless timeline the
/// scheduler computes.
pub struct DeviceOutput {
    commands: mpsc::Sender<DeviceCommand>,
    clock: OutputClock,
    thread: Option<JoinHandle<()>>,
}

impl DeviceOutput {
    /// Try to open the default output device
    pub fn try_new() -> Result<Self, OutputError> {
        let (commands, inbox) = mpsc::channel::<DeviceCommand>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), OutputError>>();

        let thread = std::thread::Builder::new()
            .name("voicestream-audio".into())
            .spawn(move || {
                let stream = match OutputStreamBuilder::open_default_stream() {
                    Ok(s) => s,
                    Err(_) => {
                        let _ = ready_tx.send(Err(OutputError::InitFailed));
                        return;
                    }
                };
                let sink = Sink::connect_new(stream.mixer());
                let _ = ready_tx.send(Ok(()));

                while let Ok(command) = inbox.recv() {
                    match command {
                        DeviceCommand::Append(audio) => {
                            let source = rodio::buffer::SamplesBuffer::new(
                                audio.channels as u16,
                                audio.sample_rate,
                                audio.samples.clone(),
                            );
                            sink.append(source);
                        }
                        DeviceCommand::Pause => sink.pause(),
                        DeviceCommand::Play => sink.play(),
                        DeviceCommand::Clear => {
                            sink.clear();
                            sink.play();
                        }
                        DeviceCommand::Shutdown => break,
                    }
                }
                sink.stop();
            })
            .map_err(|_| OutputError::InitFailed)?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                commands,
                clock: OutputClock::new(),
                thread: Some(thread),
            }),
            Ok(Err(err)) => {
                let _ = thread.join();
                Err(err)
            }
            Err(_) => {
                let _ = thread.join();
                Err(OutputError::FailedToCreateAudioSink)
            }
        }
    }

    fn send(&self, command: DeviceCommand) {
        if self.commands.send(command).is_err() {
            log::warn!("Audio thread is gone; dropping output command");
        }
    }
}

impl AudioOutput for DeviceOutput {
    fn now(&self) -> f64 {
        self.clock.now()
    }

    fn schedule(&mut self, audio: &SharedAudioData, _start_at: f64) {
        self.send(DeviceCommand::Append(SharedAudioData::clone(audio)));
    }

    fn suspend(&mut self) {
        self.send(DeviceCommand::Pause);
        self.clock.suspend();
    }

    fn resume(&mut self) {
        self.clock.resume();
        self.send(DeviceCommand::Play);
    }

    fn halt(&mut self) {
        self.send(DeviceCommand::Clear);
    }

    fn is_suspended(&self) -> bool {
        self.clock.is_suspended()
    }
}

impl Drop for DeviceOutput {
    fn drop(&mut self) {
        let _ = self.commands.send(DeviceCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
