//! The limits file: how many slots a (database, user) pair may hold.
//!
//! Line oriented, whitespace separated: database, user, max_size, and
//! optionally initial_size and min_size. Either pattern may be the literal
//! `all`. Lines starting with `#` are comments.

use crate::errors::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitConfig {
    pub database: String,
    pub username: String,
    pub max_size: usize,
    pub initial_size: usize,
    pub min_size: usize,
}

impl LimitConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_size == 0 {
            return Err(Error::BadConfig(format!(
                "limit for {}/{} has max_size 0",
                self.database, self.username
            )));
        }
        if self.initial_size > self.max_size || self.min_size > self.max_size {
            return Err(Error::BadConfig(format!(
                "limit for {}/{}: initial_size and min_size cannot exceed max_size",
                self.database, self.username
            )));
        }
        Ok(())
    }
}

pub fn parse_limits_file(contents: &str) -> Result<Vec<LimitConfig>, Error> {
    let mut limits = Vec::new();

    for (lineno, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 || fields.len() > 5 {
            return Err(Error::BadConfig(format!(
                "limits file line {}: expected 'database user max_size [initial_size [min_size]]'",
                lineno + 1
            )));
        }

        let parse_size = |s: &str| -> Result<usize, Error> {
            s.parse().map_err(|_| {
                Error::BadConfig(format!(
                    "limits file line {}: '{}' is not a size",
                    lineno + 1,
                    s
                ))
            })
        };

        limits.push(LimitConfig {
            database: fields[0].to_string(),
            username: fields[1].to_string(),
            max_size: parse_size(fields[2])?,
            initial_size: if fields.len() > 3 {
                parse_size(fields[3])?
            } else {
                0
            },
            min_size: if fields.len() > 4 {
                parse_size(fields[4])?
            } else {
                0
            },
        });
    }

    Ok(limits)
}
