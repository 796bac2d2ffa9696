//! Project authentication for the public API.
//!
//! Clients authenticate with HTTP Basic auth, using a project's public key as the username and its
//! secret key as the password. The project id attached to every generation and user-defined model
//! definition comes from the matched key pair, never from the request body.

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};
use base64::{Engine as _, engine::general_purpose};
use subtle::ConstantTimeEq;
use tracing::{instrument, trace};

use crate::{
    AppState,
    config::ProjectCredentials,
    errors::{Error, Result},
    types::ProjectId,
};

/// The project a request was authenticated as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedProject {
    pub project_id: ProjectId,
}

fn unauthenticated(message: &str) -> Error {
    Error::Unauthenticated {
        message: Some(message.to_string()),
    }
}

/// Split an `Authorization: Basic ...` header value into public and secret key.
fn parse_basic(header: &str) -> Result<(String, String)> {
    let (scheme, encoded) = header
        .split_once(' ')
        .ok_or_else(|| unauthenticated("Malformed Authorization header"))?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return Err(unauthenticated("Expected Basic authentication with public_key:secret_key"));
    }

    let decoded = general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|_| unauthenticated("Malformed Basic credentials"))?;
    let decoded = String::from_utf8(decoded).map_err(|_| unauthenticated("Malformed Basic credentials"))?;
    let (public_key, secret_key) = decoded
        .split_once(':')
        .ok_or_else(|| unauthenticated("Malformed Basic credentials"))?;
    Ok((public_key.to_string(), secret_key.to_string()))
}

/// Find the project owning the key pair. Secrets are compared in constant time.
fn find_project<'a>(projects: &'a [ProjectCredentials], public_key: &str, secret_key: &str) -> Option<&'a ProjectCredentials> {
    projects
        .iter()
        .find(|project| project.public_key == public_key)
        .filter(|project| bool::from(project.secret_key.as_bytes().ct_eq(secret_key.as_bytes())))
}

impl FromRequestParts<AppState> for AuthenticatedProject {
    type Rejection = Error;

    #[instrument(skip(parts, state))]
    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .ok_or_else(|| unauthenticated("Missing Authorization header"))?
            .to_str()
            .map_err(|_| unauthenticated("Malformed Authorization header"))?;

        let (public_key, secret_key) = parse_basic(header)?;
        let project = find_project(&state.config.auth.projects, &public_key, &secret_key)
            .ok_or_else(|| unauthenticated("Invalid public or secret key"))?;

        trace!(project_id = %project.project_id, "Authenticated project");
        Ok(AuthenticatedProject {
            project_id: project.project_id.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn basic(credentials: &str) -> String {
        format!("Basic {}", general_purpose::STANDARD.encode(credentials))
    }

    fn projects() -> Vec<ProjectCredentials> {
        vec![
            ProjectCredentials {
                project_id: "p1".to_string(),
                public_key: "pk-1".to_string(),
                secret_key: "sk-1".to_string(),
            },
            ProjectCredentials {
                project_id: "p2".to_string(),
                public_key: "pk-2".to_string(),
                secret_key: "sk-2".to_string(),
            },
        ]
    }

    #[test]
    fn test_parse_basic() {
        let (public_key, secret_key) = parse_basic(&basic("pk-1:sk:with:colons")).unwrap();
        assert_eq!(public_key, "pk-1");
        assert_eq!(secret_key, "sk:with:colons");

        assert!(parse_basic("Bearer abc").is_err());
        assert!(parse_basic("Basic !!!").is_err());
        assert!(parse_basic(&basic("no-separator")).is_err());
    }

    #[test]
    fn test_find_project() {
        let projects = projects();
        assert_eq!(find_project(&projects, "pk-2", "sk-2").map(|p| p.project_id.as_str()), Some("p2"));
        assert!(find_project(&projects, "pk-2", "sk-1").is_none());
        assert!(find_project(&projects, "pk-3", "sk-2").is_none());
        assert!(find_project(&projects, "pk-1", "").is_none());
    }
}
