use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use meowko_voice::voice::{
    self, ElevenLabsTts, FRAME_DURATION, Resampler, SessionEvent, SonioxStt, SynthesisClient,
    TRANSPORT_FORMAT, TranscriptEvent, TranscriptionClient,
};
use meowko_voice::{ChatCompletionsResponder, Config, SessionDeps, SessionState, VoiceSession};

/// Meowko - real-time voice conversations with an AI companion
#[derive(Parser)]
#[command(name = "meowko", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Stream a WAV file to speech-to-text and print transcripts
    Transcribe {
        /// 16-bit PCM WAV file
        input: PathBuf,
    },
    /// Synthesize text and write the transport-format audio to a WAV file
    Speak {
        /// Text to speak
        text: String,
        /// Output WAV path
        #[arg(short, long, default_value = "speech.wav")]
        out: PathBuf,
    },
    /// Run a full voice session over a WAV file and record the reply
    Converse {
        /// 16-bit PCM WAV file used as microphone input
        input: PathBuf,
        /// Output WAV path for everything the session played
        #[arg(short, long, default_value = "reply.wav")]
        out: PathBuf,
        /// Channel id reported to the responder
        #[arg(long, default_value = "cli")]
        channel: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,meowko_voice=info",
        1 => "info,meowko_voice=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load()?;

    match cli.command {
        Command::Transcribe { input } => transcribe(&config, &input).await,
        Command::Speak { text, out } => speak(&config, &text, &out).await,
        Command::Converse {
            input,
            out,
            channel,
        } => converse(config, &input, &out, &channel).await,
    }
}

/// Stream a file through STT at real-time pace
async fn transcribe(config: &Config, input: &Path) -> anyhow::Result<()> {
    let frames = voice::wav::read_transport_frames(input)?;
    println!("Streaming {} frames from {}", frames.len(), input.display());

    let provider = SonioxStt::new(&config.soniox, config.voice.stt_sample_rate)?;
    let client = TranscriptionClient::new(
        Arc::new(provider),
        config.voice.stt_connect_timeout,
        config.voice.capture_queue_frames,
    );
    let mut conn = client.open("cli").await?;
    let mut resampler = Resampler::to_stt(config.voice.stt_sample_rate)?;

    let mut ticker = tokio::time::interval(FRAME_DURATION);
    let mut pending = frames.into_iter();
    let mut finalized = false;

    loop {
        tokio::select! {
            _ = ticker.tick(), if !finalized => {
                if let Some(frame) = pending.next() {
                    conn.send(resampler.process(&frame)?);
                } else {
                    conn.send(resampler.finish()?);
                    conn.finalize();
                    finalized = true;
                }
            }
            event = conn.next_event() => match event {
                Some(TranscriptEvent::Interim { text }) => println!("  … {text}"),
                Some(TranscriptEvent::Final { text, utterance_id }) => {
                    println!("[{utterance_id}] {text}");
                    if finalized {
                        break;
                    }
                }
                Some(TranscriptEvent::StreamFailed { reason }) => {
                    anyhow::bail!("transcription failed: {reason}");
                }
                None => break,
            },
            () = tokio::time::sleep(config.voice.final_timeout), if finalized => {
                println!("(no further transcript)");
                break;
            }
        }
    }

    conn.close().await;
    if client.frames_dropped() > 0 {
        println!("Dropped {} frames", client.frames_dropped());
    }
    Ok(())
}

/// Synthesize text and write it out in transport format
async fn speak(config: &Config, text: &str, out: &Path) -> anyhow::Result<()> {
    let provider = ElevenLabsTts::new(&config.elevenlabs, config.voice.tts_sample_rate)?;
    let synth = SynthesisClient::new(
        Arc::new(provider),
        config.voice.tts_sample_rate,
        config.voice.tts_open_timeout,
    );
    let mut resampler = Resampler::to_playback(config.voice.tts_sample_rate)?;

    println!("Synthesizing: \"{text}\"");
    let mut stream = synth.synthesize(1, text.to_string());
    let mut frames = Vec::new();
    while let Some(item) = stream.next().await {
        let item = item?;
        frames.push(resampler.process(&item.audio)?);
        if item.end_of_response {
            frames.push(resampler.finish()?);
        }
    }

    voice::wav::write_wav(out, &frames, TRANSPORT_FORMAT)?;
    let seconds: f64 = frames.iter().map(|f| f.duration().as_secs_f64()).sum();
    println!("Wrote {seconds:.2}s of audio to {}", out.display());
    Ok(())
}

/// Drive a session with file input and a 20ms output tick
async fn converse(config: Config, input: &Path, out: &Path, channel: &str) -> anyhow::Result<()> {
    let frames = voice::wav::read_transport_frames(input)?;

    let deps = SessionDeps {
        stt: Arc::new(SonioxStt::new(&config.soniox, config.voice.stt_sample_rate)?),
        tts: Arc::new(ElevenLabsTts::new(&config.elevenlabs, config.voice.tts_sample_rate)?),
        responder: Arc::new(ChatCompletionsResponder::new(&config.llm)),
        config: config.voice.clone(),
    };
    let session = VoiceSession::spawn(channel, deps)?;
    let mut events = session.subscribe();

    let mut recorded = Vec::new();
    let mut ticker = tokio::time::interval(FRAME_DURATION);
    let mut pending = frames.into_iter();
    let mut input_done = false;
    let mut responded = false;
    // Keep feeding silence after the file so endpointing can fire
    let quiet = voice::AudioFrame::silence(TRANSPORT_FORMAT, FRAME_DURATION);
    let deadline = tokio::time::Instant::now() + config.voice.llm_timeout + Duration::from_secs(60);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let frame = pending.next().unwrap_or_else(|| {
                    input_done = true;
                    quiet.clone()
                });
                session.push_audio(frame);
                let played = session.pull_audio();
                if !played.is_silence() {
                    recorded.push(played.frame);
                }
            }
            event = events.recv() => match event {
                Ok(event) => {
                    print_event(&event);
                    if matches!(event, SessionEvent::ResponseFinished { .. }) {
                        responded = true;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "event stream lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            () = tokio::time::sleep_until(deadline) => {
                println!("(gave up waiting for a reply)");
                break;
            }
        }

        if input_done && responded && session.state() == SessionState::Idle {
            break;
        }
    }

    session.shutdown().await;
    voice::wav::write_wav(out, &recorded, TRANSPORT_FORMAT)?;

    let stats = session.stats();
    println!(
        "Recorded {} frames to {} (capture dropped {}, invalid {}, stt dropped {})",
        recorded.len(),
        out.display(),
        stats.capture_frames_dropped,
        stats.invalid_frames,
        stats.stt_frames_dropped
    );
    Ok(())
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::StateChanged(state) => println!("-- {state}"),
        SessionEvent::Transcript(TranscriptEvent::Interim { text }) => println!("  … {text}"),
        SessionEvent::Transcript(TranscriptEvent::Final { text, utterance_id }) => {
            println!("user [{utterance_id}]: {text}");
        }
        SessionEvent::ResponseText { text, .. } => println!("meowko: {text}"),
        SessionEvent::TextFallback { text, reason, .. } => {
            println!("meowko (text only, {reason}): {text}");
        }
        SessionEvent::BargeIn { generation } => println!("-- interrupted response {generation}"),
        SessionEvent::Degraded { reason } => println!("-- transcription unavailable: {reason}"),
        SessionEvent::Recovered => println!("-- transcription recovered"),
        _ => {}
    }
}

