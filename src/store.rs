//! The in-memory movie/rating/tag store that every replica owns a copy of, plus the dataset hook
//! used to seed it.
//!
//! The store is plain data: three ordered mappings and the read projections the RPC surface
//! needs. Mutation goes through the narrow operation methods so the replicated operations in
//! [`crate::oplog`] have an exact vocabulary to target.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Users are identified by numeric id, as in the MovieLens source data.
pub type UserId = u64;
/// Movies are identified by numeric id; ids for created movies are drawn at random.
pub type MovieId = u64;

/// A movie record: display name plus genre labels.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Movie {
    pub name: String,
    pub genres: BTreeSet<String>,
}

/// Rating aggregates for one movie across all users. `avg`/`min`/`max` are absent when nobody
/// has rated the movie.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RatingStats {
    pub len: usize,
    pub avg: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

/// The detail view served by `get_movie`: the record itself, the union of every user's tags, and
/// rating aggregates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MovieDetail {
    pub name: String,
    pub genres: BTreeSet<String>,
    pub tags: BTreeSet<String>,
    pub ratings: RatingStats,
}

/// One user's view of their own data, served by `get`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UserData {
    pub ratings: BTreeMap<MovieId, f64>,
    pub tags: BTreeMap<MovieId, BTreeSet<String>>,
}

/// The replicated database: movies, per-user ratings, per-user tag sets.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Db {
    pub movies: BTreeMap<MovieId, Movie>,
    pub ratings: BTreeMap<UserId, BTreeMap<MovieId, f64>>,
    pub tags: BTreeMap<UserId, BTreeMap<MovieId, BTreeSet<String>>>,
}

impl Db {
    pub fn new() -> Self {
        Db::default()
    }

    /// Inserts or replaces a movie record.
    pub fn update_movie(&mut self, movie_id: MovieId, movie: Movie) {
        self.movies.insert(movie_id, movie);
    }

    /// Sets one user's rating for one movie.
    pub fn update_rating(&mut self, user_id: UserId, movie_id: MovieId, value: f64) {
        self.ratings.entry(user_id).or_default().insert(movie_id, value);
    }

    /// Removes one user's rating for one movie, leaving their other ratings intact. Empty user
    /// maps are pruned so `get_state` snapshots compare equal across replicas.
    pub fn delete_rating(&mut self, user_id: UserId, movie_id: MovieId) {
        if let Some(ratings) = self.ratings.get_mut(&user_id) {
            ratings.remove(&movie_id);
            if ratings.is_empty() {
                self.ratings.remove(&user_id);
            }
        }
    }

    /// Adds tags to one user's tag set for one movie.
    pub fn add_tags<'a>(&mut self, user_id: UserId, movie_id: MovieId, tags: impl IntoIterator<Item = &'a str>) {
        let slot = self.tags.entry(user_id).or_default().entry(movie_id).or_default();
        for tag in tags {
            slot.insert(tag.to_string());
        }
    }

    /// Removes tags from one user's tag set for one movie, pruning empty sets and maps.
    pub fn remove_tags<'a>(&mut self, user_id: UserId, movie_id: MovieId, tags: impl IntoIterator<Item = &'a str>) {
        let Some(movies) = self.tags.get_mut(&user_id) else {
            return;
        };
        if let Some(slot) = movies.get_mut(&movie_id) {
            for tag in tags {
                slot.remove(tag);
            }
            if slot.is_empty() {
                movies.remove(&movie_id);
            }
        }
        if movies.is_empty() {
            self.tags.remove(&user_id);
        }
    }

    /// The movie id to display name mapping served by `list_movies`.
    pub fn movie_names(&self) -> BTreeMap<MovieId, String> {
        self.movies
            .iter()
            .map(|(&id, movie)| (id, movie.name.clone()))
            .collect()
    }

    /// Movies whose name contains `name` (case-sensitive substring) and whose genres include
    /// every genre in `genres`.
    pub fn search(&self, name: &str, genres: &BTreeSet<String>) -> BTreeMap<MovieId, Movie> {
        self.movies
            .iter()
            .filter(|(_, movie)| movie.name.contains(name))
            .filter(|(_, movie)| genres.iter().all(|genre| movie.genres.contains(genre)))
            .map(|(&id, movie)| (id, movie.clone()))
            .collect()
    }

    /// The aggregate detail view for one movie, or `None` if the movie is unknown.
    pub fn movie_detail(&self, movie_id: MovieId) -> Option<MovieDetail> {
        let movie = self.movies.get(&movie_id)?;
        let tags = self
            .tags
            .values()
            .filter_map(|movies| movies.get(&movie_id))
            .flatten()
            .cloned()
            .collect();
        let ratings: Vec<f64> = self
            .ratings
            .values()
            .filter_map(|ratings| ratings.get(&movie_id))
            .copied()
            .collect();
        let stats = RatingStats {
            len: ratings.len(),
            avg: if ratings.is_empty() {
                None
            } else {
                Some(ratings.iter().sum::<f64>() / ratings.len() as f64)
            },
            min: ratings.iter().copied().reduce(f64::min),
            max: ratings.iter().copied().reduce(f64::max),
        };
        Some(MovieDetail {
            name: movie.name.clone(),
            genres: movie.genres.clone(),
            tags,
            ratings: stats,
        })
    }

    /// One user's ratings and tags.
    pub fn user_data(&self, user_id: UserId) -> UserData {
        UserData {
            ratings: self.ratings.get(&user_id).cloned().unwrap_or_default(),
            tags: self.tags.get(&user_id).cloned().unwrap_or_default(),
        }
    }
}

/// The source a replica (re)builds its database from. Reconstruction calls [`Dataset::load`]
/// every time, so implementations must be deterministic: two loads must produce equal [`Db`]
/// values or replicas will never converge.
pub trait Dataset: Send + Sync {
    fn load(&self) -> Db;
}

/// A dataset captured as an in-memory snapshot at startup. This is the deterministic default:
/// the source files are parsed once and every load clones the parsed result.
#[derive(Clone, Debug, Default)]
pub struct SnapshotDataset(Db);

impl SnapshotDataset {
    pub fn new(db: Db) -> Self {
        SnapshotDataset(db)
    }

    /// An empty dataset, used when a replica group starts with no seed data.
    pub fn empty() -> Self {
        SnapshotDataset(Db::new())
    }
}

impl Dataset for SnapshotDataset {
    fn load(&self) -> Db {
        self.0.clone()
    }
}

/// Failures while parsing the seed CSV files.
#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("cannot read {name}: {source}")]
    Csv {
        name: &'static str,
        #[source]
        source: csv::Error,
    },
    #[error("malformed field {field:?} in {name} record {record}")]
    Field {
        name: &'static str,
        field: String,
        record: u64,
    },
}

/// Loads a MovieLens-style dataset directory (`movies.csv`, `ratings.csv`, `tags.csv`, each with
/// a header row) into a [`Db`]. Genre lists use the MovieLens `|` separator; the placeholder
/// `(no genres listed)` yields an empty genre set.
pub fn load_movielens(dir: &Path) -> Result<Db, DatasetError> {
    let mut db = Db::new();

    let mut movies = open_csv(dir, "movies.csv")?;
    for (row, record) in movies.records().enumerate() {
        let record = record.map_err(|source| DatasetError::Csv { name: "movies.csv", source })?;
        let movie_id = parse_field::<MovieId>("movies.csv", &record, 0, row)?;
        let name = record.get(1).unwrap_or_default().to_string();
        let genres = match record.get(2) {
            None | Some("") | Some("(no genres listed)") => BTreeSet::new(),
            Some(genres) => genres.split('|').map(str::to_string).collect(),
        };
        db.update_movie(movie_id, Movie { name, genres });
    }

    let mut ratings = open_csv(dir, "ratings.csv")?;
    for (row, record) in ratings.records().enumerate() {
        let record = record.map_err(|source| DatasetError::Csv { name: "ratings.csv", source })?;
        let user_id = parse_field::<UserId>("ratings.csv", &record, 0, row)?;
        let movie_id = parse_field::<MovieId>("ratings.csv", &record, 1, row)?;
        let value = parse_field::<f64>("ratings.csv", &record, 2, row)?;
        db.update_rating(user_id, movie_id, value);
    }

    let mut tags = open_csv(dir, "tags.csv")?;
    for (row, record) in tags.records().enumerate() {
        let record = record.map_err(|source| DatasetError::Csv { name: "tags.csv", source })?;
        let user_id = parse_field::<UserId>("tags.csv", &record, 0, row)?;
        let movie_id = parse_field::<MovieId>("tags.csv", &record, 1, row)?;
        let tag = record.get(2).unwrap_or_default();
        db.add_tags(user_id, movie_id, [tag]);
    }

    Ok(db)
}

fn open_csv(dir: &Path, name: &'static str) -> Result<csv::Reader<std::fs::File>, DatasetError> {
    csv::Reader::from_path(dir.join(name)).map_err(|source| DatasetError::Csv { name, source })
}

fn parse_field<T: std::str::FromStr>(
    name: &'static str,
    record: &csv::StringRecord,
    index: usize,
    row: usize,
) -> Result<T, DatasetError> {
    let field = record.get(index).unwrap_or_default();
    field.parse().map_err(|_| DatasetError::Field {
        name,
        field: field.to_string(),
        record: row as u64,
    })
}
