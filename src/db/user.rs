use std::{collections::HashMap, error::Error as StdError};

use argon2::{
    password_hash::{
        self, rand_core::OsRng, PasswordHasher as _, PasswordVerifier as _,
        SaltString,
    },
    Argon2,
};
use derive_more::Display;
use enum_utils::TryFromRepr;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio_postgres::{
    types::{
        accepts, private::BytesMut, to_sql_checked, FromSql, IsNull, ToSql,
        Type,
    },
    Error, Row,
};
use uuid::Uuid;

use super::Client;

#[derive(Clone, Debug)]
pub struct User {
    pub id: Id,
    pub email: String,
    pub name: String,
    pub role: Role,
    pub is_active: bool,
    pub password_hash: PasswordHash,
    pub created_at: OffsetDateTime,
}

impl User {
    /// Active user with a freshly hashed password. The email is stored
    /// trimmed and lowercased.
    pub fn new(
        email: &str,
        name: &str,
        password: &str,
        role: Role,
    ) -> Result<Self, password_hash::Error> {
        Ok(Self {
            id: Id::new(),
            email: normalize_email(email),
            name: name.trim().to_owned(),
            role,
            is_active: true,
            password_hash: PasswordHash::new(password)?,
            created_at: OffsetDateTime::now_utc(),
        })
    }
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Display,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct Id(Uuid);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl From<u128> for Id {
    fn from(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }
}

impl FromSql<'_> for Id {
    accepts!(UUID);

    fn from_sql(
        ty: &Type,
        raw: &[u8],
    ) -> Result<Self, Box<dyn StdError + Sync + Send>> {
        Uuid::from_sql(ty, raw).map(Self)
    }
}

impl ToSql for Id {
    accepts!(UUID);

    to_sql_checked!();

    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn StdError + Sync + Send>> {
        self.0.to_sql(ty, out)
    }
}

/// Roles are fixed at creation; only activation can be toggled later.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Display,
    Eq,
    Hash,
    TryFromRepr,
    PartialEq,
    Serialize,
)]
#[repr(u8)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[display("admin")]
    Admin = 1,
    #[display("executor")]
    Executor = 2,
    #[display("customer")]
    Customer = 3,
}

impl FromSql<'_> for Role {
    accepts!(INT2);

    fn from_sql(
        ty: &Type,
        raw: &[u8],
    ) -> Result<Self, Box<dyn StdError + Sync + Send>> {
        let repr = i16::from_sql(ty, raw)?;
        let repr = u8::try_from(repr)?;
        let role = Self::try_from(repr).map_err(|_| "invalid role")?;
        Ok(role)
    }
}

impl ToSql for Role {
    accepts!(INT2);

    to_sql_checked!();

    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn StdError + Sync + Send>> {
        let repr = i16::from((*self) as u8);
        repr.to_sql(ty, out)
    }
}

/// Argon2 hash in PHC string format.
#[derive(Clone, Debug, PartialEq)]
pub struct PasswordHash(String);

impl PasswordHash {
    pub fn new(secret: &str) -> Result<Self, password_hash::Error> {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(secret.as_bytes(), &salt)
            .map(|hash| Self(hash.to_string()))
    }

    pub fn verify(&self, secret: &str) -> bool {
        password_hash::PasswordHash::new(&self.0)
            .map(|parsed| {
                Argon2::default()
                    .verify_password(secret.as_bytes(), &parsed)
                    .is_ok()
            })
            .unwrap_or(false)
    }
}

impl FromSql<'_> for PasswordHash {
    accepts!(TEXT);

    fn from_sql(
        ty: &Type,
        raw: &[u8],
    ) -> Result<Self, Box<dyn StdError + Sync + Send>> {
        String::from_sql(ty, raw).map(Self)
    }
}

impl ToSql for PasswordHash {
    accepts!(TEXT);

    to_sql_checked!();

    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn StdError + Sync + Send>> {
        self.0.to_sql(ty, out)
    }
}

const COLUMNS: &str =
    "id, email, name, role, is_active, password_hash, created_at";

fn from_row(row: &Row) -> User {
    User {
        id: row.get("id"),
        email: row.get("email"),
        name: row.get("name"),
        role: row.get("role"),
        is_active: row.get("is_active"),
        password_hash: row.get("password_hash"),
        created_at: row.get("created_at"),
    }
}

impl Client {
    pub async fn get_user_by_email(
        &self,
        email: &str,
    ) -> Result<Option<User>, Error> {
        let sql = format!(
            "SELECT {COLUMNS} \
             FROM users \
             WHERE email = $1 \
             LIMIT 1"
        );
        Ok(self.0.query_opt(&sql, &[&email]).await?.as_ref().map(from_row))
    }

    pub async fn get_user_by_id(&self, id: Id) -> Result<Option<User>, Error> {
        let sql = format!(
            "SELECT {COLUMNS} \
             FROM users \
             WHERE id = $1 \
             LIMIT 1"
        );
        Ok(self.0.query_opt(&sql, &[&id]).await?.as_ref().map(from_row))
    }

    pub async fn get_users_by_ids(
        &self,
        ids: &[Id],
    ) -> Result<HashMap<Id, User>, Error> {
        let sql = format!(
            "SELECT {COLUMNS} \
             FROM users \
             WHERE id IN (SELECT unnest($1::UUID[]))"
        );
        Ok(self
            .0
            .query(&sql, &[&ids])
            .await?
            .iter()
            .map(|row| {
                let user = from_row(row);
                (user.id, user)
            })
            .collect())
    }

    pub async fn list_users(
        &self,
        role: Option<Role>,
    ) -> Result<Vec<User>, Error> {
        let sql = format!(
            "SELECT {COLUMNS} \
             FROM users \
             WHERE $1::INT2 IS NULL OR role = $1 \
             ORDER BY created_at, id"
        );
        Ok(self
            .0
            .query(&sql, &[&role])
            .await?
            .iter()
            .map(from_row)
            .collect())
    }

    pub async fn write_user(&self, user: &User) -> Result<(), Error> {
        const SQL: &str = "\
            INSERT INTO users (id, email, name, role, is_active, \
                               password_hash, created_at) \
            VALUES ($1, $2, $3, $4, $5, $6, $7) \
            ON CONFLICT (id) DO UPDATE \
            SET email = EXCLUDED.email, \
                name = EXCLUDED.name, \
                is_active = EXCLUDED.is_active, \
                password_hash = EXCLUDED.password_hash";

        self.0
            .execute(
                SQL,
                &[
                    &user.id,
                    &user.email,
                    &user.name,
                    &user.role,
                    &user.is_active,
                    &user.password_hash,
                    &user.created_at,
                ],
            )
            .await
            .map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verifies_only_matching_password() {
        let hash = PasswordHash::new("password").unwrap();
        assert!(hash.verify("password"));
        assert!(!hash.verify("Password"));
    }

    #[test]
    fn malformed_hash_never_verifies() {
        let hash = PasswordHash("plain".to_string());
        assert!(!hash.verify("plain"));
    }
}
