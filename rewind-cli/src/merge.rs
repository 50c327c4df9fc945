//! Merging fetched segments with ffmpeg.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use rewind_engine::{MergeRequest, Merger, RewindError};
use tokio::process::Command;
use tracing::{debug, info};

pub struct FfmpegMerger {
    binary: PathBuf,
}

impl FfmpegMerger {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Concat list of one input, in ffmpeg's concat demuxer syntax.
    fn concat_list(paths: &[PathBuf]) -> String {
        paths
            .iter()
            .map(|path| format!("file '{}'\n", path.display().to_string().replace('\'', "'\\''")))
            .collect()
    }

    /// Arguments for merging `request`, reading input `i` from `lists[i]`.
    /// Streams are copied; trimming is as precise as the keyframes allow.
    fn args(request: &MergeRequest, lists: &[PathBuf]) -> Vec<OsString> {
        let mut args: Vec<OsString> = ["-v", "error", "-hide_banner", "-y"]
            .into_iter()
            .map(OsString::from)
            .collect();

        for (input, list) in request.inputs.iter().zip(lists) {
            if let Some(cut_start) = input.cut_start {
                args.push("-ss".into());
                args.push(format!("{cut_start:.6}").into());
            }
            args.extend(["-f", "concat", "-safe", "0", "-i"].map(OsString::from));
            args.push(list.as_os_str().to_owned());
        }
        for index in 0..request.inputs.len() {
            args.push("-map".into());
            args.push(index.to_string().into());
        }
        if request.inputs.iter().any(|input| input.cut_end.is_some()) {
            args.push("-t".into());
            args.push(format!("{:.6}", request.duration).into());
        }
        args.extend(["-c", "copy"].map(OsString::from));
        args.push(request.output.as_os_str().to_owned());
        args
    }
}

fn list_path(output: &Path, stream: &str) -> PathBuf {
    let mut name = output.as_os_str().to_owned();
    name.push(format!(".{stream}.concat"));
    PathBuf::from(name)
}

#[async_trait]
impl Merger for FfmpegMerger {
    async fn merge(&self, request: &MergeRequest) -> rewind_engine::Result<PathBuf> {
        if let Some(parent) = request.output.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut lists = Vec::with_capacity(request.inputs.len());
        for input in &request.inputs {
            let path = list_path(&request.output, &input.stream);
            tokio::fs::write(&path, Self::concat_list(&input.paths)).await?;
            lists.push(path);
        }

        let args = Self::args(request, &lists);
        debug!(binary = %self.binary.display(), ?args, "Running ffmpeg");
        let output = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await;

        for list in &lists {
            let _ = tokio::fs::remove_file(list).await;
        }

        let output = output.map_err(|e| RewindError::Merge {
            reason: format!("cannot run {}: {e}", self.binary.display()),
        })?;
        if !output.status.success() {
            return Err(RewindError::Merge {
                reason: format!(
                    "ffmpeg exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        info!(output = %request.output.display(), "Merged segments");
        Ok(request.output.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rewind_engine::{MergeInput, StreamKind};

    fn request(cut_start: Option<f64>, cut_end: Option<f64>) -> MergeRequest {
        MergeRequest {
            inputs: vec![
                MergeInput {
                    stream: "248".to_owned(),
                    kind: StreamKind::Video,
                    paths: vec![PathBuf::from("/run/10.248.webm"), PathBuf::from("/run/11.248.webm")],
                    cut_start,
                    cut_end,
                },
                MergeInput {
                    stream: "140".to_owned(),
                    kind: StreamKind::Audio,
                    paths: vec![PathBuf::from("/run/10.140.m4a"), PathBuf::from("/run/11.140.m4a")],
                    cut_start,
                    cut_end,
                },
            ],
            duration: 7.25,
            output: PathBuf::from("/out/excerpt.mkv"),
        }
    }

    fn rendered(args: Vec<OsString>) -> String {
        args.iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn untrimmed_request_copies_both_inputs() {
        let lists = [PathBuf::from("/out/a"), PathBuf::from("/out/b")];
        let args = rendered(FfmpegMerger::args(&request(None, None), &lists));
        assert_eq!(
            args,
            "-v error -hide_banner -y -f concat -safe 0 -i /out/a -f concat -safe 0 -i /out/b \
             -map 0 -map 1 -c copy /out/excerpt.mkv"
        );
    }

    #[test]
    fn cuts_become_seek_and_duration() {
        let lists = [PathBuf::from("/out/a"), PathBuf::from("/out/b")];
        let args = rendered(FfmpegMerger::args(&request(Some(1.5), Some(3.75)), &lists));
        assert!(args.contains("-ss 1.500000 -f concat -safe 0 -i /out/a"), "{args}");
        assert!(args.contains("-t 7.250000 -c copy"), "{args}");
    }

    #[test]
    fn concat_list_escapes_quotes() {
        let list = FfmpegMerger::concat_list(&[PathBuf::from("/tmp/it's/1.140.m4a")]);
        assert_eq!(list, "file '/tmp/it'\\''s/1.140.m4a'\n");
    }
}
