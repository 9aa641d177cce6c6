//! # Core Types for the Tally System
//!
//! This module defines the data structures shared by every component: the
//! candidate roster, the identifiers that key the shared store, the outcomes
//! that cross the coordinator boundary, and the wire records of the shared
//! tally tree.
//!
//! ## Type Categories
//!
//! ### Identifiers
//! - [`CandidateId`]: stable short id assigned in the roster
//! - [`DeviceId`]: pseudo-unique token for one client installation
//!
//! ### Configuration
//! - [`Candidate`] and [`DisplayMetadata`]: immutable roster entries
//! - [`Roster`]: the validated, ordered candidate list
//!
//! ### Voting
//! - [`VoteOutcome`]: the only results a caller ever sees
//! - [`CastResult`]: what the store reports for one transaction
//! - [`VoterState`]: per-device lifecycle for the single election
//!
//! ### Wire records
//! - [`TallyRecord`]: `votes/{candidateId}` as stored
//! - [`TallySnapshot`]: the whole tree, for diagnostics
//!
//! ## Usage Examples
//!
//! ```rust
//! use tally::types::{Roster, TallyRecord};
//!
//! let roster = Roster::builtin();
//! assert_eq!(roster.len(), 4);
//!
//! let record = TallyRecord::default();
//! let next = record.admit("device-a").unwrap();
//! assert_eq!(next.count, 1);
//! assert!(next.admit("device-a").is_none());
//! ```

use crate::{Error, Result, config_error};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;

/// Characters the shared store refuses inside a path segment
const FORBIDDEN_KEY_CHARS: [char; 6] = ['.', '$', '#', '[', ']', '/'];

fn validate_key(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(config_error!("{} must not be empty", kind));
    }
    if let Some(bad) = value.chars().find(|c| FORBIDDEN_KEY_CHARS.contains(c) || c.is_control()) {
        return Err(config_error!(
            "{} {:?} contains forbidden character {:?}",
            kind,
            value,
            bad
        ));
    }
    Ok(())
}

/// Stable short identifier of a candidate
///
/// Assigned in the roster, never user-generated. Used verbatim as a path
/// segment in the shared store (`votes/{candidateId}`), so it must not
/// contain `.`, `$`, `#`, `[`, `]` or `/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CandidateId(String);

impl CandidateId {
    /// Create a candidate id, rejecting values unusable as store keys
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        validate_key("Candidate id", &id)?;
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CandidateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CandidateId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for CandidateId {
    type Error = Error;

    fn try_from(id: String) -> Result<Self> {
        Self::new(id)
    }
}

impl From<CandidateId> for String {
    fn from(id: CandidateId) -> Self {
        id.0
    }
}

/// Pseudo-unique identifier of one client installation
///
/// Collisions between devices are possible and accepted; this is a
/// deduplication key, not a security control. Clearing the local record
/// produces a new id and with it a fresh right to vote.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId(String);

impl DeviceId {
    /// Wrap an existing id, rejecting values unusable as store keys
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        validate_key("Device id", &id)?;
        Ok(Self(id))
    }

    /// Wrap an id already known to be a valid key (e.g. hex)
    pub(crate) fn from_trusted(id: String) -> Self {
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines
    pub fn short(&self) -> &str {
        let end = self.0.char_indices().nth(8).map_or(self.0.len(), |(i, _)| i);
        &self.0[..end]
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for DeviceId {
    type Error = Error;

    fn try_from(id: String) -> Result<Self> {
        Self::new(id)
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.0
    }
}

/// Presentation data for a candidate
///
/// Owned by configuration and irrelevant to voting correctness. The core
/// carries it through to the results projection and never inspects it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DisplayMetadata {
    pub name: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub achievement: String,
    /// Image reference (URL or asset path)
    #[serde(default)]
    pub image: Option<String>,
}

/// One entry of the candidate roster
///
/// # Examples
///
/// ```rust
/// use tally::types::{Candidate, CandidateId, DisplayMetadata};
///
/// let candidate = Candidate {
///     id: CandidateId::new("pam").unwrap(),
///     display: DisplayMetadata {
///         name: "The hockey player".to_string(),
///         ..Default::default()
///     },
/// };
/// assert_eq!(candidate.id.as_str(), "pam");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Unique, stable id; also the store key
    pub id: CandidateId,

    /// Name, category, description and so on
    #[serde(flatten)]
    pub display: DisplayMetadata,
}

impl Candidate {
    pub fn new(id: &str, name: &str) -> Result<Self> {
        Ok(Self {
            id: CandidateId::new(id)?,
            display: DisplayMetadata {
                name: name.to_string(),
                ..Default::default()
            },
        })
    }
}

/// The immutable, ordered candidate list for the single election
///
/// Order is significant: it is the tie-break order of the rankings. A roster
/// is validated on construction (non-empty, unique ids) and never mutated
/// afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Roster {
    candidates: Vec<Candidate>,
}

impl Roster {
    /// Build a validated roster
    pub fn new(candidates: Vec<Candidate>) -> Result<Self> {
        if candidates.is_empty() {
            return Err(config_error!("Roster must contain at least one candidate"));
        }

        let mut seen = HashSet::new();
        for candidate in &candidates {
            if !seen.insert(candidate.id.as_str()) {
                return Err(config_error!("Duplicate candidate id {:?}", candidate.id.as_str()));
            }
        }

        Ok(Self { candidates })
    }

    /// Parse a roster from a JSON array of candidates
    pub fn from_json_str(json: &str) -> Result<Self> {
        let candidates: Vec<Candidate> = serde_json::from_str(json)
            .map_err(|e| config_error!("Invalid roster JSON: {}", e))?;
        Self::new(candidates)
    }

    /// Load a roster from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| config_error!("Cannot read roster {}: {}", path.display(), e))?;
        Self::from_json_str(&json)
    }

    /// The four-candidate charity roster shipped with the widget
    pub fn builtin() -> Self {
        let entry = |id: &str, name: &str, description: &str, achievement: &str, image: &str| Candidate {
            id: CandidateId(id.to_string()),
            display: DisplayMetadata {
                name: name.to_string(),
                category: "Donations".to_string(),
                description: description.to_string(),
                achievement: achievement.to_string(),
                image: Some(format!("assets/{image}")),
            },
        };

        Self {
            candidates: vec![
                entry(
                    "pam",
                    "The hockey player",
                    "The best hockey player in the world who gives back to the community.",
                    "Big funds raised for charity",
                    "hockeyplayer.jpg",
                ),
                entry(
                    "perez",
                    "The marathonist",
                    "He took part in a charity marathon.",
                    "Completed a full marathon for a good cause",
                    "marathonist.jpg",
                ),
                entry(
                    "nicole",
                    "The raiser",
                    "Here for a good cause, raising funds for those in need.",
                    "Broke records in charity fundraising",
                    "charity.jpg",
                ),
                entry(
                    "fabio",
                    "Mr beast",
                    "The most generous person on the planet.",
                    "Philanthropist of the year",
                    "mr-beast.jpg",
                ),
            ],
        }
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Candidate> {
        self.candidates.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = &CandidateId> {
        self.candidates.iter().map(|c| &c.id)
    }

    /// Look up a candidate by its raw id
    pub fn get(&self, id: &str) -> Option<&Candidate> {
        self.candidates.iter().find(|c| c.id.as_str() == id)
    }

    /// Configuration order of a candidate
    pub fn position(&self, id: &str) -> Option<usize> {
        self.candidates.iter().position(|c| c.id.as_str() == id)
    }

    /// Resolve a raw id to a roster entry, failing fast on unknown ids
    pub fn resolve(&self, id: &str) -> Result<&Candidate> {
        self.get(id)
            .ok_or_else(|| config_error!("Unknown candidate id {:?}", id))
    }
}

impl<'de> Deserialize<'de> for Roster {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let candidates = Vec::<Candidate>::deserialize(deserializer)?;
        Roster::new(candidates).map_err(serde::de::Error::custom)
    }
}

/// Outcome of a cast request as seen by the caller and the renderer
///
/// `AlreadyVoted` is a normal outcome, not an error. `TransientFailure`
/// means the vote was not recorded and may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoteOutcome {
    Committed,
    AlreadyVoted,
    TransientFailure,
}

/// Result of one atomic transaction against a candidate record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastResult {
    /// The device was added to the voters; carries the committed count
    Committed { count: u64 },
    /// The device was already among the voters; nothing changed
    AlreadyVoted,
}

/// Voting lifecycle of this device for the single election
///
/// ```text
/// NotVoted --cast--> Voting --commit--> Voted --cast--> VotingDenied
///                      |
///                      +--failure--> NotVoted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoterState {
    NotVoted,
    Voting,
    Voted,
    VotingDenied,
}

impl VoterState {
    /// Whether a vote from this device has been counted
    pub fn has_voted(&self) -> bool {
        matches!(self, Self::Voted | Self::VotingDenied)
    }
}

/// A candidate's record in the shared store (`votes/{candidateId}`)
///
/// `voters` maps device ids to a presence marker. Only key existence matters
/// for deduplication; existing stores may hold `true` or a timestamp.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TallyRecord {
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub voters: BTreeMap<String, serde_json::Value>,
}

impl TallyRecord {
    pub fn has_voter(&self, device_id: &str) -> bool {
        self.voters.contains_key(device_id)
    }

    /// The read-modify-write body of a vote transaction
    ///
    /// Returns `None` (abort, no mutation) when the device is already a
    /// voter, otherwise the record with the device added and the count
    /// incremented.
    pub fn admit(&self, device_id: &str) -> Option<TallyRecord> {
        if self.has_voter(device_id) {
            return None;
        }

        let mut next = self.clone();
        next.voters
            .insert(device_id.to_string(), serde_json::Value::Bool(true));
        next.count += 1;
        Some(next)
    }

    /// Whether `count == |voters|`
    pub fn is_consistent(&self) -> bool {
        self.count == self.voters.len() as u64
    }
}

/// The whole shared tree, in wire shape
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TallySnapshot {
    #[serde(default)]
    pub votes: BTreeMap<String, TallyRecord>,
    #[serde(rename = "totalVotes", default)]
    pub total_votes: u64,
}

impl TallySnapshot {
    /// Sum of per-candidate counts (may briefly differ from `total_votes`)
    pub fn counted(&self) -> u64 {
        self.votes.values().map(|r| r.count).sum()
    }

    /// The candidate whose voters include this device, if any
    pub fn vote_of(&self, device_id: &str) -> Option<&str> {
        self.votes
            .iter()
            .find(|(_, record)| record.has_voter(device_id))
            .map(|(id, _)| id.as_str())
    }
}
