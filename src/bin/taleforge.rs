// taleforge - drive the generation orchestrator from the command line

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use taleforge::orchestration::{ArtifactContent, ContentKind, GenerationRequest, Payload, Role};
use taleforge::{Credentials, Orchestrator, TaleforgeConfig};
use termimad::{MadSkin, crossterm::style::Color};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about = "Generate adventure text, images and speech", long_about = None)]
struct Args {
    /// Path to configuration file (TOML); defaults to the user config dir
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug)]
struct Common {
    /// Model id (falls back to the default for the kind)
    #[arg(short, long)]
    model: Option<String>,

    /// Family-friendly mode with a second moderation pass
    #[arg(long)]
    safe: bool,

    /// Language to respond in
    #[arg(short, long)]
    language: Option<String>,
}

#[derive(clap::Args, Debug)]
struct Scene {
    /// Free prompt text
    #[arg(short, long, conflicts_with_all = ["context", "action"])]
    prompt: Option<String>,

    /// Recent story lines (`Sender: text`, one per line)
    #[arg(long)]
    context: Option<String>,

    /// The action to answer or illustrate
    #[arg(short, long)]
    action: Option<String>,
}

impl Scene {
    fn payload(self) -> anyhow::Result<Payload> {
        match (self.prompt, self.action) {
            (Some(prompt), _) => Ok(Payload::prompt(prompt)),
            (None, Some(action)) => Ok(Payload::scene(self.context.unwrap_or_default(), action)),
            (None, None) => anyhow::bail!("Either --prompt or --action is required"),
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RoleArg {
    /// Dungeon Master
    Narrator,
    /// Player character
    Character,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    Text,
    Image,
    Tts,
    Stt,
}

impl From<KindArg> for ContentKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Text => ContentKind::Text,
            KindArg::Image => ContentKind::Image,
            KindArg::Tts => ContentKind::SpeechSynthesis,
            KindArg::Stt => ContentKind::SpeechRecognition,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate the next story turn
    Narrate {
        #[command(flatten)]
        scene: Scene,
        #[command(flatten)]
        common: Common,
        #[arg(short, long, value_enum, default_value = "narrator")]
        role: RoleArg,
    },
    /// Illustrate a story moment
    Illustrate {
        #[command(flatten)]
        scene: Scene,
        #[command(flatten)]
        common: Common,
        /// Art style, e.g. "hand-drawn"
        #[arg(short, long)]
        style: Option<String>,
        /// Story theme
        #[arg(short, long)]
        theme: Option<String>,
        /// Output file path (PNG format)
        #[arg(short, long, default_value = "scene.png")]
        output: PathBuf,
    },
    /// Synthesize speech
    Speak {
        /// Text to speak
        text: String,
        #[command(flatten)]
        common: Common,
        #[arg(long)]
        voice: Option<String>,
        #[arg(short, long, default_value = "speech.mp3")]
        output: PathBuf,
    },
    /// Transcribe recorded speech
    Transcribe {
        /// Audio file (webm)
        input: PathBuf,
        #[command(flatten)]
        common: Common,
    },
    /// List models
    Models {
        #[arg(short, long, value_enum)]
        kind: Option<KindArg>,
    },
    /// List voices of a speech model
    Voices {
        #[arg(short, long)]
        model: Option<String>,
    },
    /// Show orchestrator health
    Health,
}

fn create_markdown_skin() -> MadSkin {
    let mut skin = MadSkin::default();
    skin.headers[0].set_fg(Color::Cyan);
    skin.bold.set_fg(Color::White);
    skin.italic.set_fg(Color::Magenta);
    skin.bullet.set_fg(Color::Green);
    skin
}

fn apply(request: GenerationRequest, common: Common) -> GenerationRequest {
    let mut request = request.with_safety_mode(common.safe);
    if let Some(model) = common.model {
        request = request.with_model(model);
    }
    if let Some(language) = common.language {
        request = request.with_language(language);
    }
    request
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("⚠ .env file couldn't be loaded: {}", e);
        }
    }

    let args = Args::parse();

    let log_level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("taleforge={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = TaleforgeConfig::load(args.config.as_deref())?;
    let orchestrator = Orchestrator::from_config(&config, &Credentials::from_env())?;

    match args.command {
        Command::Narrate { scene, common, role } => {
            let role = match role {
                RoleArg::Narrator => Role::Narrator,
                RoleArg::Character => Role::Character,
            };
            let request = apply(GenerationRequest::text(scene.payload()?), common).with_role(role);
            let artifact = orchestrator.generate(request).await?;

            let skin = create_markdown_skin();
            if let ArtifactContent::Text { text, turn } = &artifact.content {
                match turn {
                    Some(turn) => {
                        skin.print_text(&format!("# {}\n\n{}\n", turn.role, turn.content));
                        for option in &turn.options {
                            skin.print_text(&format!("* {}", option));
                        }
                    }
                    None => skin.print_text(text),
                }
            }
            if artifact.substituted {
                eprintln!("(content was rewritten by the safety check)");
            }
        }
        Command::Illustrate {
            scene,
            common,
            style,
            theme,
            output,
        } => {
            let mut request = apply(GenerationRequest::image(scene.payload()?), common);
            if let Some(style) = style {
                request = request.with_style(style);
            }
            if let Some(theme) = theme {
                request = request.with_theme(theme);
            }
            let artifact = orchestrator.generate(request).await?;
            if let ArtifactContent::Image { png, prompt } = &artifact.content {
                std::fs::write(&output, png).with_context(|| format!("Failed to write {}", output.display()))?;
                println!("✓ {} saved to {}", artifact.model_id, output.display());
                println!("  Prompt: {}", prompt);
            }
        }
        Command::Speak {
            text,
            common,
            voice,
            output,
        } => {
            let mut request = apply(GenerationRequest::speech(text), common);
            if let Some(voice) = voice {
                request = request.with_voice(voice);
            }
            let artifact = orchestrator.generate(request).await?;
            if let ArtifactContent::Audio { bytes, mime } = &artifact.content {
                std::fs::write(&output, bytes).with_context(|| format!("Failed to write {}", output.display()))?;
                println!("✓ {} ({}) saved to {}", artifact.model_id, mime, output.display());
            }
        }
        Command::Transcribe { input, common } => {
            let audio = std::fs::read(&input).with_context(|| format!("Failed to read {}", input.display()))?;
            let artifact = orchestrator
                .generate(apply(GenerationRequest::transcription(audio), common))
                .await?;
            if let Some(text) = artifact.text() {
                println!("{}", text);
            }
        }
        Command::Models { kind } => {
            let kinds = match kind {
                Some(kind) => vec![ContentKind::from(kind)],
                None => ContentKind::ALL.to_vec(),
            };
            for kind in kinds {
                println!("{}:", kind);
                for model in orchestrator.models(kind) {
                    let marker = if model.default { "*" } else { " " };
                    println!(
                        " {} {:<18} {:<28} {:?}/{:?}",
                        marker, model.id, model.name, model.locality, model.resource_class
                    );
                }
            }
        }
        Command::Voices { model } => {
            for voice in orchestrator.voices(model.as_deref())? {
                println!("{:<12} {}", voice.id, voice.name);
            }
        }
        Command::Health => {
            println!("{}", serde_json::to_string_pretty(&orchestrator.health())?);
        }
    }

    Ok(())
}
