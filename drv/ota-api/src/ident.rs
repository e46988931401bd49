// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::ParamError;

/// Application version carried in a versioned image identifier.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AppVersion {
    pub major: u8,
    pub minor: u8,
    pub build: u16,
}

/// Longest accepted `major.minor.build` prefix.
const MAX_VERSION_LEN: usize = 15;

impl AppVersion {
    /// Parses `major.minor.build`.
    pub fn parse(s: &str) -> Option<Self> {
        if s.is_empty() || s.len() > MAX_VERSION_LEN {
            return None;
        }
        let mut parts = s.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let build = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            major,
            minor,
            build,
        })
    }
}

/// Checks an incoming image identifier against the board's image file name.
///
/// Two forms are accepted: the bare file name, or the file name prefixed by
/// its version as `major.minor.build/<name>`. The version is returned in the
/// second case.
pub fn parse_image_identifier(
    id: &str,
    expected_name: &str,
) -> Result<Option<AppVersion>, ParamError> {
    if id == expected_name {
        return Ok(None);
    }
    let (version, name) = id.split_once('/').ok_or(ParamError::BadImageName)?;
    if name != expected_name {
        return Err(ParamError::BadImageName);
    }
    AppVersion::parse(version)
        .map(Some)
        .ok_or(ParamError::BadImageName)
}
