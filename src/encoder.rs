use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use thiserror::Error;
use tokio::{
    io::AsyncReadExt,
    process::{Child, Command},
};
use tracing::debug;

const TEST_PATTERN_SOURCE: &str = "color=c=black:s=1280x720:d=5";
const TEST_PATTERN_OVERLAY: &str = "drawtext=text='BeeSwarm Render':fontcolor=white:fontsize=48:x=(w-text_w)/2:y=(h-text_h)/2";

#[derive(Debug, Error)]
pub enum EncoderError {
    #[error("ffmpeg not found on PATH; install ffmpeg or use a runner that includes it")]
    NotFound,

    #[error("failed to spawn encoder {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed waiting for encoder: {0}")]
    Wait(#[from] std::io::Error),
}

/// How an encode ended. Spawn and I/O problems are errors, not outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeOutcome {
    Succeeded,
    Failed { exit_code: Option<i32> },
}

/// The render command. The output path is always passed as the final argument.
#[derive(Debug, Clone)]
pub struct Encoder {
    program: PathBuf,
    args: Vec<String>,
}

impl Encoder {
    /// Resolves `ffmpeg` on `PATH`. A missing binary is a deployment error.
    pub fn locate() -> Result<Self, EncoderError> {
        let program = which::which("ffmpeg").map_err(|_| EncoderError::NotFound)?;
        Ok(Self::ffmpeg(program))
    }

    pub fn ffmpeg(program: impl Into<PathBuf>) -> Self {
        let args = [
            "-y",
            "-f",
            "lavfi",
            "-i",
            TEST_PATTERN_SOURCE,
            "-vf",
            TEST_PATTERN_OVERLAY,
        ]
        .into_iter()
        .map(String::from)
        .collect();

        Self {
            program: program.into(),
            args,
        }
    }

    pub fn custom(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn command_args(&self, output_path: &Path) -> Vec<String> {
        let mut args = self.args.clone();
        args.push(output_path.display().to_string());
        args
    }

    /// Runs the encoder to completion, calling `on_chunk` once per chunk of
    /// diagnostic output read from stderr.
    pub async fn run<F, Fut>(
        &self,
        output_path: &Path,
        mut on_chunk: F,
    ) -> Result<EncodeOutcome, EncoderError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let args = self.command_args(output_path);
        debug!("Running encoder: {} {}", self.program.display(), args.join(" "));

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| EncoderError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;

        drain_stderr(&mut child, &mut on_chunk).await?;

        let status = child.wait().await?;
        if status.success() {
            Ok(EncodeOutcome::Succeeded)
        } else {
            Ok(EncodeOutcome::Failed {
                exit_code: status.code(),
            })
        }
    }
}

async fn drain_stderr<F, Fut>(child: &mut Child, on_chunk: &mut F) -> Result<(), EncoderError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let Some(mut stderr) = child.stderr.take() else {
        return Ok(());
    };

    let mut buf = [0u8; 4096];
    loop {
        let read = stderr.read(&mut buf).await?;
        if read == 0 {
            return Ok(());
        }
        on_chunk().await;
    }
}
