// Copyright (c) The Taipan Project Developers.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Helpers for fetching metadata files through a [`Transport`] with an
//! endless-data guard.

use crate::error::{self, Result};
use crate::transport::Transport;
use snafu::{ensure, ResultExt};
use std::io::Read;
use std::path::Path;
use url::Url;

/// Fetches `url`, failing once more than `max_size` bytes have been read.
/// `specifier` names the limit in the error message.
pub(crate) fn fetch_max_size(
    transport: &dyn Transport,
    url: Url,
    max_size: u64,
    specifier: &'static str,
) -> Result<Vec<u8>> {
    let mut reader = transport
        .fetch(url.clone())
        .context(error::TransportSnafu { url: url.clone() })?;

    let mut data = Vec::new();
    let mut buf = [0; 8 * 1024];
    loop {
        let n = reader.read(&mut buf).context(error::FileReadSnafu {
            path: url.path().to_string(),
        })?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        ensure!(
            data.len() as u64 <= max_size,
            error::MaxSizeExceededSnafu {
                max_size,
                specifier
            }
        );
    }
    Ok(data)
}

/// Fetches `url` into a local file, typically a scratch location that is
/// promoted into the metadata cache only after verification.
pub(crate) fn fetch_to_file(
    transport: &dyn Transport,
    url: Url,
    max_size: u64,
    specifier: &'static str,
    path: &Path,
) -> Result<()> {
    let data = fetch_max_size(transport, url, max_size, specifier)?;
    std::fs::write(path, data).context(error::FileWriteSnafu { path })
}
