//! Identifier definitions.

use crate::{define_name, IdError};

const MAX_HOSTNAME_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

fn validate_label(kind: &'static str, label: &str) -> Result<(), IdError> {
    let invalid = |message| IdError::InvalidLabel {
        kind,
        label: label.to_string(),
        message,
    };

    if label.is_empty() {
        return Err(invalid("empty label"));
    }
    if label.len() > MAX_LABEL_LEN {
        return Err(invalid("label longer than 63 characters"));
    }
    if label.starts_with('-') || label.ends_with('-') {
        return Err(invalid("label must not start or end with '-'"));
    }
    if !label
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    {
        return Err(invalid("label may only contain [a-z0-9-]"));
    }
    Ok(())
}

// =============================================================================
// Hosts and Containers
// =============================================================================

define_name!(HostName, "hostname");

impl HostName {
    fn validate(s: &str) -> Result<(), IdError> {
        if s.len() > MAX_HOSTNAME_LEN {
            return Err(IdError::TooLong {
                kind: Self::KIND,
                len: s.len(),
                max: MAX_HOSTNAME_LEN,
            });
        }
        s.split('.')
            .try_for_each(|label| validate_label(Self::KIND, label))
    }

    /// The first DNS label.
    #[must_use]
    pub fn first_label(&self) -> &str {
        self.0.split('.').next().unwrap_or(&self.0)
    }
}

define_name!(ContainerName, "container name");

impl ContainerName {
    fn validate(s: &str) -> Result<(), IdError> {
        validate_label(Self::KIND, s)
    }

    /// The container for a node is named after the first label of its hostname.
    #[must_use]
    pub fn from_hostname(hostname: &HostName) -> Self {
        Self(hostname.first_label().to_string())
    }
}

// =============================================================================
// Images
// =============================================================================

define_name!(DockerImage, "docker image");

impl DockerImage {
    fn validate(s: &str) -> Result<(), IdError> {
        if s.chars().any(char::is_whitespace) {
            return Err(IdError::InvalidFormat {
                kind: Self::KIND,
                message: format!("'{s}' contains whitespace"),
            });
        }
        let (repository, tag) = split_tag(s);
        if repository.is_empty() {
            return Err(IdError::InvalidFormat {
                kind: Self::KIND,
                message: format!("'{s}' has no repository"),
            });
        }
        if tag == Some("") {
            return Err(IdError::InvalidFormat {
                kind: Self::KIND,
                message: format!("'{s}' has an empty tag"),
            });
        }
        Ok(())
    }

    /// The "no image" value, used when clearing the current image of a node.
    #[must_use]
    pub fn empty() -> Self {
        Self(String::new())
    }

    /// Returns true for [`DockerImage::empty`].
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Repository part, without the tag.
    #[must_use]
    pub fn repository(&self) -> &str {
        split_tag(&self.0).0
    }

    /// Tag, if any.
    #[must_use]
    pub fn tag(&self) -> Option<&str> {
        split_tag(&self.0).1
    }

    /// The tag interpreted as a dotted numeric version, e.g. `8.123.4`.
    #[must_use]
    pub fn tag_as_version(&self) -> Option<&str> {
        self.tag().filter(|tag| {
            tag.split('.')
                .all(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()))
        })
    }
}

/// Splits `repo[:tag]`. A colon before the last `/` belongs to a registry port.
fn split_tag(s: &str) -> (&str, Option<&str>) {
    let name_start = s.rfind('/').map_or(0, |i| i + 1);
    match s[name_start..].rfind(':') {
        Some(i) => (&s[..name_start + i], Some(&s[name_start + i + 1..])),
        None => (s, None),
    }
}
