//! The canonical type-path representation used throughout the compiler.
//!
//! A Dream path like `/mob/player` is the identity of a type. Paths come in
//! four kinds distinguished by their prefix: absolute (`/a/b`), relative
//! (`a/b`), upward (`..` or `../a`), and downward (`.` or `./a`).

use std::fmt;

use smallvec::SmallVec;

/// How a path anchors relative to the current scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum PathKind {
    Absolute,
    Relative,
    Upward,
    Downward,
}

/// A slash-separated type path. Two paths compare equal iff kind and
/// elements match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct DreamPath {
    pub kind: PathKind,
    pub elements: SmallVec<[String; 4]>,
}

impl DreamPath {
    /// The absolute root path `/`.
    #[must_use]
    pub fn root() -> Self {
        Self {
            kind: PathKind::Absolute,
            elements: SmallVec::new(),
        }
    }

    #[must_use]
    pub fn absolute<I, S>(elements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind: PathKind::Absolute,
            elements: elements.into_iter().map(Into::into).collect(),
        }
    }

    #[must_use]
    pub fn relative<I, S>(elements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind: PathKind::Relative,
            elements: elements.into_iter().map(Into::into).collect(),
        }
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.kind == PathKind::Absolute && self.elements.is_empty()
    }

    #[must_use]
    pub fn last(&self) -> Option<&str> {
        self.elements.last().map(String::as_str)
    }

    #[must_use]
    pub fn contains(&self, element: &str) -> bool {
        self.elements.iter().any(|e| e == element)
    }

    /// Returns this path with the last element removed. Removing from the
    /// root yields the root.
    #[must_use]
    pub fn remove_last(&self) -> Self {
        let mut elements = self.elements.clone();
        elements.pop();
        Self {
            kind: self.kind,
            elements,
        }
    }

    /// Combines this path with another according to the other's kind:
    /// absolute replaces, relative appends, upward pops one level per step
    /// before appending, downward appends in place.
    #[must_use]
    pub fn combine(&self, other: &Self) -> Self {
        match other.kind {
            PathKind::Absolute => other.clone(),
            PathKind::Relative | PathKind::Downward => {
                let mut elements = self.elements.clone();
                elements.extend(other.elements.iter().cloned());
                Self {
                    kind: self.kind,
                    elements,
                }
            }
            PathKind::Upward => {
                let mut elements = self.elements.clone();
                elements.pop();
                elements.extend(other.elements.iter().cloned());
                Self {
                    kind: self.kind,
                    elements,
                }
            }
        }
    }

    /// Parses a path string; the inverse of `Display`.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let (kind, rest) = if let Some(rest) = text.strip_prefix("/") {
            (PathKind::Absolute, rest)
        } else if let Some(rest) = text.strip_prefix("..") {
            (PathKind::Upward, rest.strip_prefix('/').unwrap_or(rest))
        } else if let Some(rest) = text.strip_prefix('.') {
            (PathKind::Downward, rest.strip_prefix('/').unwrap_or(rest))
        } else {
            (PathKind::Relative, text)
        };
        let elements = rest
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(ToOwned::to_owned)
            .collect();
        Self { kind, elements }
    }
}

impl fmt::Display for DreamPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.kind {
            PathKind::Absolute => "/",
            PathKind::Relative => "",
            PathKind::Upward => "..",
            PathKind::Downward => ".",
        };
        if self.elements.is_empty() {
            return write!(f, "{prefix}");
        }
        match self.kind {
            PathKind::Absolute => write!(f, "/{}", self.elements.join("/")),
            PathKind::Relative => write!(f, "{}", self.elements.join("/")),
            PathKind::Upward => write!(f, "../{}", self.elements.join("/")),
            PathKind::Downward => write!(f, "./{}", self.elements.join("/")),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn combine_absolute_replaces() {
        let base = DreamPath::absolute(["mob"]);
        let other = DreamPath::absolute(["obj", "item"]);
        assert_eq!(base.combine(&other), other);
    }

    #[test]
    fn combine_relative_appends() {
        let base = DreamPath::absolute(["mob"]);
        let other = DreamPath::relative(["player"]);
        assert_eq!(base.combine(&other), DreamPath::absolute(["mob", "player"]));
    }

    #[test]
    fn combine_upward_pops_one_level() {
        let base = DreamPath::absolute(["mob", "player"]);
        let other = DreamPath {
            kind: PathKind::Upward,
            elements: ["enemy"].into_iter().map(ToOwned::to_owned).collect(),
        };
        assert_eq!(base.combine(&other), DreamPath::absolute(["mob", "enemy"]));
    }

    #[test]
    fn parse_to_string_round_trips() {
        for text in ["/", "/mob/player", "obj/item", "..", "../sibling", ".", "./child"] {
            let path = DreamPath::parse(text);
            assert_eq!(path.to_string(), text, "round trip failed for {text}");
            assert_eq!(DreamPath::parse(&path.to_string()), path);
        }
    }

    #[test]
    fn root_properties() {
        assert!(DreamPath::root().is_root());
        assert!(!DreamPath::absolute(["datum"]).is_root());
        assert_eq!(DreamPath::root().to_string(), "/");
        assert_eq!(DreamPath::absolute(["datum"]).remove_last(), DreamPath::root());
    }
}
