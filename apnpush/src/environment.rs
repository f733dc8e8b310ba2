use std::fmt::{self, Display};
use std::str::FromStr;

use serde_derive::{Deserialize, Serialize};

/// Which APNs deployment to talk to
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    None,
    Sandbox,
    Production,
    /// Pick from what the certificate supports
    #[default]
    Auto,
}

impl Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Environment::None => "none",
            Environment::Sandbox => "sandbox",
            Environment::Production => "production",
            Environment::Auto => "auto",
        })
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Environment::None),
            "sandbox" | "development" => Ok(Environment::Sandbox),
            "production" => Ok(Environment::Production),
            "auto" => Ok(Environment::Auto),
            other => Err(format!("Unknown environment: {other}")),
        }
    }
}

/// The environments a certificate can be used against
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EnvironmentCapability {
    None,
    SandboxOnly,
    ProductionOnly,
    Either,
}

impl EnvironmentCapability {
    /// Resolve `Auto` against this capability. Explicit choices are kept as is.
    pub fn resolve(self, requested: Environment) -> Environment {
        match requested {
            Environment::Auto => match self {
                EnvironmentCapability::None => Environment::None,
                EnvironmentCapability::SandboxOnly => Environment::Sandbox,
                EnvironmentCapability::ProductionOnly | EnvironmentCapability::Either => {
                    Environment::Production
                }
            },
            explicit => explicit,
        }
    }

    pub fn supports(self, environment: Environment) -> bool {
        matches!(
            (self, environment),
            (EnvironmentCapability::Either, Environment::Sandbox)
                | (EnvironmentCapability::Either, Environment::Production)
                | (EnvironmentCapability::SandboxOnly, Environment::Sandbox)
                | (EnvironmentCapability::ProductionOnly, Environment::Production)
        )
    }
}

impl Display for EnvironmentCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EnvironmentCapability::None => "No environment",
            EnvironmentCapability::SandboxOnly => "Sandbox",
            EnvironmentCapability::ProductionOnly => "Production",
            EnvironmentCapability::Either => "Sandbox|Production",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_auto() {
        use Environment::*;
        assert_eq!(EnvironmentCapability::SandboxOnly.resolve(Auto), Sandbox);
        assert_eq!(EnvironmentCapability::ProductionOnly.resolve(Auto), Production);
        assert_eq!(EnvironmentCapability::Either.resolve(Auto), Production);
        assert_eq!(EnvironmentCapability::None.resolve(Auto), None);
        assert_eq!(EnvironmentCapability::Either.resolve(Sandbox), Sandbox);
    }

    #[test]
    fn parse_and_display() {
        for env in [
            Environment::None,
            Environment::Sandbox,
            Environment::Production,
            Environment::Auto,
        ] {
            assert_eq!(env.to_string().parse::<Environment>(), Ok(env));
        }
        assert!("staging".parse::<Environment>().is_err());
        assert_eq!(
            EnvironmentCapability::Either.to_string(),
            "Sandbox|Production"
        );
        assert!(EnvironmentCapability::Either.supports(Environment::Sandbox));
        assert!(!EnvironmentCapability::ProductionOnly.supports(Environment::Sandbox));
    }
}
