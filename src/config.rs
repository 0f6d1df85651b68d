use std::{net, path::PathBuf, str::FromStr, time};

use derive_more::{Display, Error};
use serde::Deserialize;

#[derive(Deserialize)]
pub struct Config {
    pub db: Db,
    pub http: Http,
    pub jwt: Jwt,
    #[serde(default)]
    pub media: Media,
    #[serde(default)]
    pub cleanup: Cleanup,
    #[serde(default)]
    pub notify: Notify,
    pub bootstrap: Option<Bootstrap>,
}

#[derive(Deserialize)]
pub struct Db {
    /// PostgreSQL connection URL, or `memory://` for the in-process store.
    pub url: String,
}

#[derive(Deserialize)]
pub struct Http {
    pub server: Server,
    pub cors: Cors,
}

#[derive(Deserialize)]
pub struct Server {
    pub addr: net::SocketAddr,
}

#[derive(Deserialize)]
pub struct Cors {
    pub allowed_origins: Vec<String>,
}

#[derive(Clone, Deserialize)]
pub struct Jwt {
    pub secret: String,
    #[serde(with = "humantime_serde")]
    pub expiration_time: time::Duration,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Media {
    pub dir: PathBuf,
    pub max_file_size: usize,
    pub allowed_extensions: Vec<String>,
    /// Unreferenced files younger than this survive the orphan sweep.
    #[serde(with = "humantime_serde")]
    pub orphan_min_age: time::Duration,
}

impl Default for Media {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("media"),
            max_file_size: 10 * 1024 * 1024,
            allowed_extensions: [".jpg", ".jpeg", ".png", ".webp"]
                .into_iter()
                .map(String::from)
                .collect(),
            orphan_min_age: time::Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Cleanup {
    #[serde(with = "humantime_serde")]
    pub retention: time::Duration,
    pub daily_at: TimeOfDay,
    pub weekly_on: Weekday,
    pub weekly_at: TimeOfDay,
}

impl Default for Cleanup {
    fn default() -> Self {
        Self {
            retention: time::Duration::from_secs(90 * 24 * 60 * 60),
            daily_at: TimeOfDay { hour: 2, minute: 0 },
            weekly_on: Weekday::Sunday,
            weekly_at: TimeOfDay { hour: 3, minute: 0 },
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Notify {
    #[serde(with = "humantime_serde")]
    pub send_timeout: time::Duration,
    /// Capacity of each connection's outbound queue.
    pub buffer: usize,
    pub audience: Audience,
}

impl Default for Notify {
    fn default() -> Self {
        Self {
            send_timeout: time::Duration::from_secs(2),
            buffer: 32,
            audience: Audience::Admins,
        }
    }
}

/// Who receives ticket events besides the ticket's customer and executor.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Audience {
    #[default]
    Admins,
    Everyone,
}

#[derive(Clone, Deserialize)]
pub struct Bootstrap {
    pub email: String,
    pub name: String,
    pub password: String,
}

/// UTC wall-clock time written as `HH:MM`.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(try_from = "String")]
pub struct TimeOfDay {
    pub hour: u8,
    pub minute: u8,
}

impl TimeOfDay {
    pub fn time(self) -> ::time::Time {
        ::time::Time::from_hms(self.hour, self.minute, 0)
            .unwrap_or(::time::Time::MIDNIGHT)
    }
}

#[derive(Debug, Display, Error)]
#[display("expected time of day as HH:MM, got `{_0}`")]
pub struct InvalidTimeOfDay(#[error(not(source))] String);

impl FromStr for TimeOfDay {
    type Err = InvalidTimeOfDay;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || InvalidTimeOfDay(s.to_string());
        let (hour, minute) = s.split_once(':').ok_or_else(err)?;
        let hour = hour.parse::<u8>().map_err(|_| err())?;
        let minute = minute.parse::<u8>().map_err(|_| err())?;
        if hour > 23 || minute > 59 {
            return Err(err());
        }
        Ok(Self { hour, minute })
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = InvalidTimeOfDay;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Weekday {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl From<Weekday> for ::time::Weekday {
    fn from(value: Weekday) -> Self {
        match value {
            Weekday::Monday => Self::Monday,
            Weekday::Tuesday => Self::Tuesday,
            Weekday::Wednesday => Self::Wednesday,
            Weekday::Thursday => Self::Thursday,
            Weekday::Friday => Self::Friday,
            Weekday::Saturday => Self::Saturday,
            Weekday::Sunday => Self::Sunday,
        }
    }
}
