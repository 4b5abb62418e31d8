//! Writing a file verbatim into the image, e.g. a bootloader.
//!
//! ```yaml
//! - action: raw
//!   origin: recipe
//!   source: u-boot-sunxi-with-spl.bin
//!   offset: {{ sector 16 }}
//! ```

use std::os::unix::fs::FileExt;

use anyhow::{anyhow, Context as _, Result};
use camino::Utf8Path;
use fn_error_context::context;
use serde::Deserialize;

use crate::action::{describe_or, Action};
use crate::context::{Context, ORIGIN_RECIPE};

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Offset {
    Bytes(u64),
    Expr(String),
}

fn default_origin() -> String {
    ORIGIN_RECIPE.to_owned()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawAction {
    #[serde(default)]
    description: Option<String>,
    #[serde(default = "default_origin")]
    origin: String,
    source: String,
    #[serde(default)]
    offset: Option<Offset>,
    /// Write into this partition instead of the whole image.
    #[serde(default)]
    partition: Option<String>,
    #[serde(skip)]
    byte_offset: u64,
}

/// Parse a byte offset, decimal or `0x` prefixed hexadecimal.
fn parse_offset(s: &str) -> Result<u64> {
    let s = s.trim();
    let r = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    r.with_context(|| format!("Invalid offset {s:?}"))
}

/// Feed `content` to `write_at` until all of it is written; a single write
/// may be short (the kernel caps one at just under 2 GiB).
fn write_all_with(
    mut content: &[u8],
    mut offset: u64,
    mut write_at: impl FnMut(&[u8], u64) -> std::io::Result<usize>,
) -> std::io::Result<()> {
    while !content.is_empty() {
        match write_at(content, offset) {
            Ok(0) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    format!("{} bytes left unwritten at offset {offset}", content.len()),
                ))
            }
            Ok(n) => {
                content = &content[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Write all of `content` to `target` at `offset`, then flush it to disk.
#[context("Writing {} bytes to {target} at offset {offset}", content.len())]
fn write_at_offset(target: &Utf8Path, content: &[u8], offset: u64) -> Result<()> {
    let f = std::fs::OpenOptions::new().write(true).open(target)?;
    write_all_with(content, offset, |buf, off| f.write_at(buf, off))?;
    f.sync_all()?;
    Ok(())
}

impl Action for RawAction {
    fn verify(&mut self, _ctx: &mut Context) -> Result<()> {
        if self.origin.is_empty() {
            anyhow::bail!("origin must not be empty");
        }
        if self.source.is_empty() {
            anyhow::bail!("source is required");
        }
        self.byte_offset = match &self.offset {
            None => 0,
            Some(Offset::Bytes(n)) => *n,
            Some(Offset::Expr(s)) => parse_offset(s)?,
        };
        Ok(())
    }

    fn run(&mut self, ctx: &mut Context) -> Result<()> {
        let source = ctx.require_origin(&self.origin)?.join(&self.source);
        let content = std::fs::read(&source).with_context(|| format!("Reading {source}"))?;
        let target = match self.partition.as_deref() {
            Some(name) => ctx
                .partition_device(name)
                .ok_or_else(|| anyhow!("No partition named {name} in the image"))?,
            None => ctx
                .image
                .as_deref()
                .ok_or_else(|| anyhow!("No image to write to"))?,
        };
        tracing::info!("Writing {source} to {target} at offset {}", self.byte_offset);
        write_at_offset(target, &content, self.byte_offset)
    }

    fn describe(&self) -> String {
        describe_or(self.description.as_deref(), || {
            let target = self.partition.as_deref().unwrap_or("image");
            format!("Write {} to {target}", self.source)
        })
    }
}
