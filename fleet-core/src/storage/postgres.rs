use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};
use sqlx::{
    PgPool, QueryBuilder, Row,
    postgres::{PgPoolOptions, PgRow},
};
use uuid::Uuid;

use super::{
    CommandFilter, DeviceFilter, EventFilter, NewCommand, NewDevice, NewRelease, NewRule, Storage,
};
use crate::error::CoreError;
use crate::model::*;

#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new().max_connections(10).connect(database_url).await?;

        sqlx::migrate!().run(&pool).await?;

        Ok(Self { pool })
    }

    fn enum_str<T: Serialize>(value: &T) -> Result<String> {
        serde_json::to_value(value)
            .context("serializing enum")?
            .as_str()
            .context("enum is not a string")
            .map(str::to_string)
    }

    fn parse_enum<T: DeserializeOwned>(value: String) -> Result<T> {
        serde_json::from_str(&format!("\"{value}\"")).context("invalid enum value")
    }

    fn is_unique_violation(err: &sqlx::Error) -> bool {
        matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
    }

    fn row_to_user(row: PgRow) -> Result<User> {
        Ok(User {
            id: UserId(row.try_get("id")?),
            email: row.try_get("email")?,
            password_hash: row.try_get("password_hash")?,
            is_admin: row.try_get("is_admin")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn row_to_hub_inventory(row: PgRow) -> Result<HubInventory> {
        Ok(HubInventory {
            hub_id: row.try_get("hub_id")?,
            serial: row.try_get("serial")?,
            model_id: row.try_get("model_id")?,
            setup_code_hash: row.try_get("setup_code_hash")?,
            mqtt_secret_hash: row.try_get("mqtt_secret_hash")?,
            status: Self::parse_enum(row.try_get("status")?)?,
            claimed_by_user_id: row.try_get::<Option<i64>, _>("claimed_by_user_id")?.map(UserId),
            claimed_home_id: row.try_get::<Option<i64>, _>("claimed_home_id")?.map(HomeId),
            claimed_at: row.try_get("claimed_at")?,
            failed_attempts: row.try_get("failed_attempts")?,
            last_failed_at: row.try_get("last_failed_at")?,
        })
    }

    fn row_to_device_inventory(row: PgRow) -> Result<DeviceInventory> {
        Ok(DeviceInventory {
            serial: row.try_get("serial")?,
            device_uid: row.try_get("device_uid")?,
            type_default: row.try_get("type_default")?,
            protocol: Self::parse_enum(row.try_get("protocol")?)?,
            model_id: row.try_get("model_id")?,
            setup_code_hash: row.try_get("setup_code_hash")?,
            mqtt_secret_hash: row.try_get("mqtt_secret_hash")?,
            status: Self::parse_enum(row.try_get("status")?)?,
            claimed_by_user_id: row.try_get::<Option<i64>, _>("claimed_by_user_id")?.map(UserId),
            claimed_home_id: row.try_get::<Option<i64>, _>("claimed_home_id")?.map(HomeId),
            claimed_at: row.try_get("claimed_at")?,
            failed_attempts: row.try_get("failed_attempts")?,
            last_failed_at: row.try_get("last_failed_at")?,
        })
    }

    fn row_to_hub(row: PgRow) -> Result<Hub> {
        Ok(Hub {
            hub_id: row.try_get("hub_id")?,
            home_id: HomeId(row.try_get("home_id")?),
            firmware_version: row.try_get("firmware_version")?,
            online: row.try_get("online")?,
            last_seen: row.try_get("last_seen")?,
        })
    }

    fn row_to_device(row: PgRow) -> Result<Device> {
        Ok(Device {
            id: DeviceId(row.try_get("id")?),
            device_uid: row.try_get("device_uid")?,
            home_id: row.try_get::<Option<i64>, _>("home_id")?.map(HomeId),
            room_id: row.try_get::<Option<i64>, _>("room_id")?.map(RoomId),
            device_type: row.try_get("device_type")?,
            protocol: Self::parse_enum(row.try_get("protocol")?)?,
            hub_id: row.try_get("hub_id")?,
            zigbee_ieee: row.try_get("zigbee_ieee")?,
            lifecycle_status: Self::parse_enum(row.try_get("lifecycle_status")?)?,
            serial: row.try_get("serial")?,
            model_id: row.try_get("model_id")?,
            firmware_version: row.try_get("firmware_version")?,
            bound_at: row.try_get("bound_at")?,
            unbound_at: row.try_get("unbound_at")?,
        })
    }

    fn row_to_state(row: PgRow) -> Result<DeviceStateCurrent> {
        Ok(DeviceStateCurrent {
            device_id: DeviceId(row.try_get("device_id")?),
            state: row.try_get("state")?,
            last_seen: row.try_get("last_seen")?,
            online: row.try_get("online")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_history(row: PgRow) -> Result<DeviceStateHistoryRow> {
        Ok(DeviceStateHistoryRow {
            device_id: DeviceId(row.try_get("device_id")?),
            state: row.try_get("state")?,
            online: row.try_get("online")?,
            last_seen: row.try_get("last_seen")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn row_to_event(row: PgRow) -> Result<DeviceEvent> {
        Ok(DeviceEvent {
            id: row.try_get("id")?,
            device_id: DeviceId(row.try_get("device_id")?),
            home_id: HomeId(row.try_get("home_id")?),
            event_type: row.try_get("event_type")?,
            data: row.try_get("data")?,
            source_at: row.try_get("source_at")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn row_to_command(row: PgRow) -> Result<Command> {
        let target = match row.try_get::<Option<i64>, _>("device_id")? {
            Some(device) => CommandTarget::Device(DeviceId(device)),
            None => CommandTarget::Hub(row.try_get("hub_id")?),
        };
        Ok(Command {
            id: row.try_get("id")?,
            target,
            home_id: HomeId(row.try_get("home_id")?),
            cmd_id: row.try_get("cmd_id")?,
            payload: row.try_get("payload")?,
            status: Self::parse_enum(row.try_get("status")?)?,
            sent_at: row.try_get("sent_at")?,
            acked_at: row.try_get("acked_at")?,
            error: row.try_get("error")?,
        })
    }

    fn row_to_release(row: PgRow) -> Result<FirmwareRelease> {
        Ok(FirmwareRelease {
            id: row.try_get("id")?,
            target_type: row.try_get("target_type")?,
            version: row.try_get("version")?,
            url: row.try_get("url")?,
            sha256: row.try_get("sha256")?,
            size: row.try_get("size")?,
            notes: row.try_get("notes")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn row_to_rollout(row: PgRow) -> Result<FirmwareRollout> {
        Ok(FirmwareRollout {
            id: row.try_get("id")?,
            release_id: row.try_get("release_id")?,
            status: Self::parse_enum(row.try_get("status")?)?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_target(row: PgRow) -> Result<RolloutTarget> {
        Ok(RolloutTarget {
            rollout_id: row.try_get("rollout_id")?,
            hub_id: row.try_get("hub_id")?,
            state: Self::parse_enum(row.try_get("state")?)?,
            attempt: row.try_get("attempt")?,
            cmd_id: row.try_get("cmd_id")?,
            sent_at: row.try_get("sent_at")?,
            acked_at: row.try_get("acked_at")?,
            last_msg: row.try_get("last_msg")?,
            next_attempt_at: row.try_get("next_attempt_at")?,
        })
    }

    fn row_to_rule(row: PgRow) -> Result<AutomationRule> {
        let actions: serde_json::Value = row.try_get("actions")?;
        Ok(AutomationRule {
            id: row.try_get("id")?,
            home_id: HomeId(row.try_get("home_id")?),
            name: row.try_get("name")?,
            enabled: row.try_get("enabled")?,
            version: row.try_get("version")?,
            trigger_type: Self::parse_enum(row.try_get("trigger_type")?)?,
            trigger: row.try_get("trigger_def")?,
            actions: serde_json::from_value(actions).context("rule actions must be an array")?,
            execution_policy: row.try_get("execution_policy")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_deployment(row: PgRow) -> Result<AutomationDeployment> {
        Ok(AutomationDeployment {
            hub_id: row.try_get("hub_id")?,
            home_id: HomeId(row.try_get("home_id")?),
            desired_version: row.try_get("desired_version")?,
            applied_version: row.try_get("applied_version")?,
            status: Self::parse_enum(row.try_get("status")?)?,
            last_msg: row.try_get("last_msg")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_discovered(row: PgRow) -> Result<ZigbeeDiscoveredDevice> {
        Ok(ZigbeeDiscoveredDevice {
            hub_id: row.try_get("hub_id")?,
            ieee: row.try_get("ieee")?,
            short_addr: row.try_get("short_addr")?,
            manufacturer: row.try_get("manufacturer")?,
            model: row.try_get("model")?,
            sw_build_id: row.try_get("sw_build_id")?,
            suggested_model_id: row.try_get("suggested_model_id")?,
            pairing_token: row.try_get("pairing_token")?,
            status: Self::parse_enum(row.try_get("status")?)?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_reset(row: PgRow) -> Result<ResetRequest> {
        Ok(ResetRequest {
            id: row.try_get("id")?,
            device_id: DeviceId(row.try_get("device_id")?),
            kind: Self::parse_enum(row.try_get("kind")?)?,
            cmd_id: row.try_get("cmd_id")?,
            status: Self::parse_enum(row.try_get("status")?)?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn create_user(&self, email: &str, password_hash: &str, is_admin: bool) -> Result<User> {
        let row = sqlx::query(
            "INSERT INTO users (email, password_hash, is_admin) VALUES ($1, $2, $3)
            RETURNING id, email, password_hash, is_admin, created_at",
        )
        .bind(email)
        .bind(password_hash)
        .bind(is_admin)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if Self::is_unique_violation(&e) {
                anyhow::Error::from(CoreError::conflict("email already registered"))
            } else {
                e.into()
            }
        })?;
        Self::row_to_user(row)
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>> {
        let row = sqlx::query(
            "SELECT id, email, password_hash, is_admin, created_at FROM users WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Self::row_to_user).transpose()
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let row = sqlx::query(
            "SELECT id, email, password_hash, is_admin, created_at FROM users WHERE email = $1",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Self::row_to_user).transpose()
    }

    async fn insert_session(&self, session: Session) -> Result<()> {
        sqlx::query(
            "INSERT INTO sessions (token, user_id, created_at, expires_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(session.token)
        .bind(session.user_id.0)
        .bind(session.created_at)
        .bind(session.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_session(&self, token: Uuid) -> Result<Option<Session>> {
        let row = sqlx::query(
            "SELECT token, user_id, created_at, expires_at FROM sessions WHERE token = $1",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| {
            Ok(Session {
                token: r.try_get("token")?,
                user_id: UserId(r.try_get("user_id")?),
                created_at: r.try_get("created_at")?,
                expires_at: r.try_get("expires_at")?,
            })
        })
        .transpose()
    }

    async fn create_home(&self, name: &str, owner: UserId) -> Result<Home> {
        let row = sqlx::query(
            "INSERT INTO homes (name, owner_user_id) VALUES ($1, $2)
            RETURNING id, name, owner_user_id",
        )
        .bind(name)
        .bind(owner.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(Home {
            id: HomeId(row.try_get("id")?),
            name: row.try_get("name")?,
            owner_user_id: UserId(row.try_get("owner_user_id")?),
        })
    }

    async fn get_home(&self, id: HomeId) -> Result<Option<Home>> {
        let row = sqlx::query("SELECT id, name, owner_user_id FROM homes WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            Ok(Home {
                id: HomeId(r.try_get("id")?),
                name: r.try_get("name")?,
                owner_user_id: UserId(r.try_get("owner_user_id")?),
            })
        })
        .transpose()
    }

    async fn home_ids_for_user(&self, user: UserId) -> Result<Vec<HomeId>> {
        let ids: Vec<i64> =
            sqlx::query_scalar("SELECT id FROM homes WHERE owner_user_id = $1 ORDER BY id")
                .bind(user.0)
                .fetch_all(&self.pool)
                .await?;
        Ok(ids.into_iter().map(HomeId).collect())
    }

    async fn get_room(&self, id: RoomId) -> Result<Option<Room>> {
        let row = sqlx::query("SELECT id, home_id, name FROM rooms WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            Ok(Room {
                id: RoomId(r.try_get("id")?),
                home_id: HomeId(r.try_get("home_id")?),
                name: r.try_get("name")?,
            })
        })
        .transpose()
    }

    async fn insert_hub_inventory(&self, row: HubInventory) -> Result<()> {
        sqlx::query(
            "INSERT INTO hub_inventory (hub_id, serial, model_id, setup_code_hash, status)
            VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&row.hub_id)
        .bind(&row.serial)
        .bind(&row.model_id)
        .bind(&row.setup_code_hash)
        .bind(Self::enum_str(&row.status)?)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if Self::is_unique_violation(&e) {
                anyhow::Error::from(CoreError::conflict(format!(
                    "hub {} already exists",
                    row.hub_id
                )))
            } else {
                e.into()
            }
        })?;
        Ok(())
    }

    async fn get_hub_inventory(&self, hub_id: &str) -> Result<Option<HubInventory>> {
        let row = sqlx::query("SELECT * FROM hub_inventory WHERE hub_id = $1")
            .bind(hub_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::row_to_hub_inventory).transpose()
    }

    async fn list_hub_inventory(&self) -> Result<Vec<HubInventory>> {
        let rows = sqlx::query("SELECT * FROM hub_inventory ORDER BY hub_id")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Self::row_to_hub_inventory).collect()
    }

    async fn claim_hub_inventory(
        &self,
        hub_id: &str,
        user: UserId,
        home: HomeId,
        mqtt_secret_hash: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE hub_inventory SET
                status = 'CLAIMED',
                claimed_by_user_id = $2,
                claimed_home_id = $3,
                claimed_at = $4,
                mqtt_secret_hash = $5,
                failed_attempts = 0
            WHERE hub_id = $1 AND status = 'FACTORY_NEW'",
        )
        .bind(hub_id)
        .bind(user.0)
        .bind(home.0)
        .bind(at)
        .bind(mqtt_secret_hash)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_hub_claim_failure(&self, hub_id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE hub_inventory SET failed_attempts = failed_attempts + 1, last_failed_at = $2
            WHERE hub_id = $1",
        )
        .bind(hub_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_device_inventory(&self, row: DeviceInventory) -> Result<()> {
        sqlx::query(
            "INSERT INTO device_inventory
                (serial, device_uid, type_default, protocol, model_id, setup_code_hash, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(&row.serial)
        .bind(row.device_uid)
        .bind(&row.type_default)
        .bind(Self::enum_str(&row.protocol)?)
        .bind(&row.model_id)
        .bind(&row.setup_code_hash)
        .bind(Self::enum_str(&row.status)?)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if Self::is_unique_violation(&e) {
                anyhow::Error::from(CoreError::conflict(format!(
                    "serial {} already exists",
                    row.serial
                )))
            } else {
                e.into()
            }
        })?;
        Ok(())
    }

    async fn get_device_inventory(&self, serial: &str) -> Result<Option<DeviceInventory>> {
        let row = sqlx::query("SELECT * FROM device_inventory WHERE serial = $1")
            .bind(serial)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::row_to_device_inventory).transpose()
    }

    async fn list_device_inventory(&self) -> Result<Vec<DeviceInventory>> {
        let rows = sqlx::query("SELECT * FROM device_inventory ORDER BY serial")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Self::row_to_device_inventory).collect()
    }

    async fn claim_device_inventory(
        &self,
        serial: &str,
        user: UserId,
        home: HomeId,
        mqtt_secret_hash: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE device_inventory SET
                status = 'CLAIMED',
                claimed_by_user_id = $2,
                claimed_home_id = $3,
                claimed_at = $4,
                mqtt_secret_hash = $5,
                failed_attempts = 0
            WHERE serial = $1 AND status = 'FACTORY_NEW'",
        )
        .bind(serial)
        .bind(user.0)
        .bind(home.0)
        .bind(at)
        .bind(mqtt_secret_hash)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_device_claim_failure(&self, serial: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE device_inventory SET failed_attempts = failed_attempts + 1, last_failed_at = $2
            WHERE serial = $1",
        )
        .bind(serial)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn release_device_inventory(&self, serial: &str) -> Result<()> {
        sqlx::query(
            "UPDATE device_inventory SET
                status = 'FACTORY_NEW',
                claimed_by_user_id = NULL,
                claimed_home_id = NULL,
                claimed_at = NULL,
                mqtt_secret_hash = NULL
            WHERE serial = $1",
        )
        .bind(serial)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_hub(&self, hub: Hub) -> Result<()> {
        sqlx::query(
            "INSERT INTO hubs (hub_id, home_id, firmware_version, online, last_seen)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (hub_id) DO UPDATE SET
                home_id = EXCLUDED.home_id,
                firmware_version = EXCLUDED.firmware_version,
                online = EXCLUDED.online,
                last_seen = EXCLUDED.last_seen",
        )
        .bind(&hub.hub_id)
        .bind(hub.home_id.0)
        .bind(&hub.firmware_version)
        .bind(hub.online)
        .bind(hub.last_seen)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_hub(&self, hub_id: &str) -> Result<Option<Hub>> {
        let row = sqlx::query("SELECT * FROM hubs WHERE hub_id = $1")
            .bind(hub_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::row_to_hub).transpose()
    }

    async fn list_hubs(&self, home_id: Option<HomeId>) -> Result<Vec<Hub>> {
        let mut qb = QueryBuilder::new("SELECT * FROM hubs");
        if let Some(home) = home_id {
            qb.push(" WHERE home_id = ");
            qb.push_bind(home.0);
        }
        qb.push(" ORDER BY hub_id");
        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.into_iter().map(Self::row_to_hub).collect()
    }

    async fn set_hub_presence(
        &self,
        hub_id: &str,
        online: bool,
        last_seen: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE hubs SET online = $2, last_seen = $3 WHERE hub_id = $1")
            .bind(hub_id)
            .bind(online)
            .bind(last_seen)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_hub_firmware(&self, hub_id: &str, version: &str) -> Result<()> {
        sqlx::query("UPDATE hubs SET firmware_version = $2 WHERE hub_id = $1")
            .bind(hub_id)
            .bind(version)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_device(&self, new: NewDevice) -> Result<Device> {
        let row = sqlx::query(
            "INSERT INTO devices
                (device_uid, home_id, room_id, device_type, protocol, hub_id, zigbee_ieee,
                 lifecycle_status, serial, model_id, bound_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING *",
        )
        .bind(&new.device_uid)
        .bind(new.home_id.0)
        .bind(new.room_id.map(|r| r.0))
        .bind(&new.device_type)
        .bind(Self::enum_str(&new.protocol)?)
        .bind(&new.hub_id)
        .bind(&new.zigbee_ieee)
        .bind(Self::enum_str(&new.lifecycle_status)?)
        .bind(&new.serial)
        .bind(&new.model_id)
        .bind(new.bound_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if Self::is_unique_violation(&e) {
                anyhow::Error::from(CoreError::conflict("deviceId already in use"))
            } else {
                e.into()
            }
        })?;
        Self::row_to_device(row)
    }

    async fn get_device(&self, id: DeviceId) -> Result<Option<Device>> {
        let row = sqlx::query("SELECT * FROM devices WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::row_to_device).transpose()
    }

    async fn get_device_by_uid(&self, device_uid: &str) -> Result<Option<Device>> {
        let row = sqlx::query("SELECT * FROM devices WHERE device_uid = $1")
            .bind(device_uid)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::row_to_device).transpose()
    }

    async fn get_device_by_ieee(&self, ieee: &str) -> Result<Option<Device>> {
        let row = sqlx::query("SELECT * FROM devices WHERE zigbee_ieee = $1")
            .bind(ieee)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::row_to_device).transpose()
    }

    async fn get_device_by_serial(&self, serial: &str) -> Result<Option<Device>> {
        let row = sqlx::query("SELECT * FROM devices WHERE serial = $1")
            .bind(serial)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::row_to_device).transpose()
    }

    async fn list_devices(&self, filter: DeviceFilter) -> Result<Vec<Device>> {
        let mut qb = QueryBuilder::new(
            "SELECT d.* FROM devices d
            LEFT JOIN device_state_current s ON s.device_id = d.id WHERE TRUE",
        );
        if let Some(home) = filter.home_id {
            qb.push(" AND d.home_id = ");
            qb.push_bind(home.0);
        }
        if let Some(model) = filter.model_id {
            qb.push(" AND d.model_id = ");
            qb.push_bind(model);
        }
        if let Some(online) = filter.online {
            qb.push(" AND COALESCE(s.online, FALSE) = ");
            qb.push_bind(online);
        }
        qb.push(" ORDER BY d.id");
        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.into_iter().map(Self::row_to_device).collect()
    }

    async fn set_device_lifecycle(&self, id: DeviceId, status: LifecycleStatus) -> Result<()> {
        sqlx::query("UPDATE devices SET lifecycle_status = $2 WHERE id = $1")
            .bind(id.0)
            .bind(Self::enum_str(&status)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn bind_zigbee_device(
        &self,
        id: DeviceId,
        ieee: &str,
        hub_id: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE devices SET zigbee_ieee = $2, hub_id = $3, lifecycle_status = 'BOUND',
                bound_at = $4
            WHERE id = $1",
        )
        .bind(id.0)
        .bind(ieee)
        .bind(hub_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn unbind_device(&self, id: DeviceId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE devices SET lifecycle_status = 'UNBOUND', unbound_at = $2,
                home_id = NULL, room_id = NULL
            WHERE id = $1",
        )
        .bind(id.0)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn rebind_device(
        &self,
        id: DeviceId,
        home: HomeId,
        room: Option<RoomId>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE devices SET home_id = $2, room_id = $3, lifecycle_status = 'BOUND',
                bound_at = $4, unbound_at = NULL
            WHERE id = $1",
        )
        .bind(id.0)
        .bind(home.0)
        .bind(room.map(|r| r.0))
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_device_firmware(&self, id: DeviceId, version: &str) -> Result<()> {
        sqlx::query("UPDATE devices SET firmware_version = $2 WHERE id = $1")
            .bind(id.0)
            .bind(version)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_state_current(&self, device: DeviceId) -> Result<Option<DeviceStateCurrent>> {
        let row = sqlx::query("SELECT * FROM device_state_current WHERE device_id = $1")
            .bind(device.0)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::row_to_state).transpose()
    }

    async fn put_state_current(&self, row: DeviceStateCurrent) -> Result<()> {
        sqlx::query(
            "INSERT INTO device_state_current (device_id, state, last_seen, online, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (device_id) DO UPDATE SET
                state = EXCLUDED.state,
                last_seen = EXCLUDED.last_seen,
                online = EXCLUDED.online,
                updated_at = EXCLUDED.updated_at",
        )
        .bind(row.device_id.0)
        .bind(&row.state)
        .bind(row.last_seen)
        .bind(row.online)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_state_history(&self, row: DeviceStateHistoryRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO device_state_history (device_id, state, online, last_seen, created_at)
            VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(row.device_id.0)
        .bind(&row.state)
        .bind(row.online)
        .bind(row.last_seen)
        .bind(row.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn state_history(
        &self,
        device: DeviceId,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<DeviceStateHistoryRow>> {
        let mut qb = QueryBuilder::new(
            "SELECT device_id, state, online, last_seen, created_at
            FROM device_state_history WHERE device_id = ",
        );
        qb.push_bind(device.0);
        if let Some(since_ts) = since {
            qb.push(" AND created_at >= ");
            qb.push_bind(since_ts);
        }
        qb.push(" ORDER BY created_at DESC LIMIT ");
        qb.push_bind(limit as i64);
        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.into_iter().map(Self::row_to_history).collect()
    }

    async fn append_device_event(
        &self,
        device: DeviceId,
        home: HomeId,
        event_type: &str,
        data: serde_json::Value,
        source_at: DateTime<Utc>,
    ) -> Result<DeviceEvent> {
        let row = sqlx::query(
            "INSERT INTO device_events (device_id, home_id, event_type, data, source_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *",
        )
        .bind(device.0)
        .bind(home.0)
        .bind(event_type)
        .bind(&data)
        .bind(source_at)
        .fetch_one(&self.pool)
        .await?;
        Self::row_to_event(row)
    }

    async fn list_events(&self, filter: EventFilter) -> Result<Vec<DeviceEvent>> {
        let mut qb = QueryBuilder::new("SELECT * FROM device_events WHERE TRUE");
        if let Some(home) = filter.home_id {
            qb.push(" AND home_id = ");
            qb.push_bind(home.0);
        }
        if let Some(device) = filter.device_id {
            qb.push(" AND device_id = ");
            qb.push_bind(device.0);
        }
        if let Some(date) = filter.date {
            qb.push(" AND created_at::date = ");
            qb.push_bind(date);
        }
        if let Some(event_type) = filter.event_type {
            qb.push(" AND event_type = ");
            qb.push_bind(event_type);
        }
        qb.push(" ORDER BY id DESC");
        if filter.limit > 0 {
            qb.push(" LIMIT ");
            qb.push_bind(filter.limit as i64);
        }
        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.into_iter().map(Self::row_to_event).collect()
    }

    async fn insert_command(&self, new: NewCommand) -> Result<Command> {
        let (device_id, hub_id) = match &new.target {
            CommandTarget::Device(id) => (Some(id.0), None),
            CommandTarget::Hub(hub) => (None, Some(hub.clone())),
        };
        let row = sqlx::query(
            "INSERT INTO commands (device_id, hub_id, home_id, cmd_id, payload, status, sent_at)
            VALUES ($1, $2, $3, $4, $5, 'PENDING', $6)
            RETURNING *",
        )
        .bind(device_id)
        .bind(hub_id)
        .bind(new.home_id.0)
        .bind(&new.cmd_id)
        .bind(&new.payload)
        .bind(new.sent_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if Self::is_unique_violation(&e) {
                anyhow::Error::from(CoreError::conflict("duplicate cmdId for target"))
            } else {
                e.into()
            }
        })?;
        Self::row_to_command(row)
    }

    async fn get_command(&self, id: i64) -> Result<Option<Command>> {
        let row = sqlx::query("SELECT * FROM commands WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::row_to_command).transpose()
    }

    async fn get_command_by_cmd_id(&self, cmd_id: &str) -> Result<Option<Command>> {
        let row = sqlx::query("SELECT * FROM commands WHERE cmd_id = $1")
            .bind(cmd_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::row_to_command).transpose()
    }

    async fn transition_command(
        &self,
        cmd_id: &str,
        to: CommandStatus,
        acked_at: Option<DateTime<Utc>>,
        error: Option<String>,
    ) -> Result<Option<Command>> {
        let row = sqlx::query(
            "UPDATE commands SET status = $2, acked_at = $3, error = $4
            WHERE cmd_id = $1 AND status = 'PENDING'
            RETURNING *",
        )
        .bind(cmd_id)
        .bind(Self::enum_str(&to)?)
        .bind(acked_at)
        .bind(error)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Self::row_to_command).transpose()
    }

    async fn list_commands(&self, filter: CommandFilter) -> Result<Vec<Command>> {
        let mut qb = QueryBuilder::new("SELECT * FROM commands WHERE TRUE");
        if let Some(status) = filter.status {
            qb.push(" AND status = ");
            qb.push_bind(Self::enum_str(&status)?);
        }
        if let Some(device) = filter.device_id {
            qb.push(" AND device_id = ");
            qb.push_bind(device.0);
        }
        if let Some(date) = filter.date {
            qb.push(" AND sent_at::date = ");
            qb.push_bind(date);
        }
        qb.push(" ORDER BY sent_at DESC");
        if filter.limit > 0 {
            qb.push(" LIMIT ");
            qb.push_bind(filter.limit as i64);
        }
        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.into_iter().map(Self::row_to_command).collect()
    }

    async fn list_pending_commands(&self) -> Result<Vec<Command>> {
        let rows = sqlx::query("SELECT * FROM commands WHERE status = 'PENDING' ORDER BY sent_at")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Self::row_to_command).collect()
    }

    async fn insert_release(&self, new: NewRelease) -> Result<FirmwareRelease> {
        let row = sqlx::query(
            "INSERT INTO firmware_releases (target_type, version, url, sha256, size, notes)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *",
        )
        .bind(&new.target_type)
        .bind(&new.version)
        .bind(&new.url)
        .bind(&new.sha256)
        .bind(new.size)
        .bind(&new.notes)
        .fetch_one(&self.pool)
        .await?;
        Self::row_to_release(row)
    }

    async fn get_release(&self, id: i64) -> Result<Option<FirmwareRelease>> {
        let row = sqlx::query("SELECT * FROM firmware_releases WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::row_to_release).transpose()
    }

    async fn list_releases(&self) -> Result<Vec<FirmwareRelease>> {
        let rows = sqlx::query("SELECT * FROM firmware_releases ORDER BY id DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Self::row_to_release).collect()
    }

    async fn create_rollout(
        &self,
        release_id: i64,
        hub_ids: Vec<String>,
    ) -> Result<FirmwareRollout> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "INSERT INTO firmware_rollouts (release_id, status) VALUES ($1, 'CREATED')
            RETURNING *",
        )
        .bind(release_id)
        .fetch_one(&mut *tx)
        .await?;
        let rollout = Self::row_to_rollout(row)?;
        for hub_id in &hub_ids {
            sqlx::query(
                "INSERT INTO rollout_targets (rollout_id, hub_id, state) VALUES ($1, $2, 'CREATED')",
            )
            .bind(rollout.id)
            .bind(hub_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(rollout)
    }

    async fn get_rollout(&self, id: i64) -> Result<Option<FirmwareRollout>> {
        let row = sqlx::query("SELECT * FROM firmware_rollouts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::row_to_rollout).transpose()
    }

    async fn list_rollouts(&self) -> Result<Vec<FirmwareRollout>> {
        let rows = sqlx::query("SELECT * FROM firmware_rollouts ORDER BY id DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Self::row_to_rollout).collect()
    }

    async fn set_rollout_status(&self, id: i64, status: RolloutStatus) -> Result<()> {
        sqlx::query("UPDATE firmware_rollouts SET status = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(Self::enum_str(&status)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_rollout_targets(&self, rollout_id: i64) -> Result<Vec<RolloutTarget>> {
        let rows =
            sqlx::query("SELECT * FROM rollout_targets WHERE rollout_id = $1 ORDER BY hub_id")
                .bind(rollout_id)
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(Self::row_to_target).collect()
    }

    async fn update_rollout_target(&self, target: RolloutTarget) -> Result<()> {
        sqlx::query(
            "UPDATE rollout_targets SET
                state = $3, attempt = $4, cmd_id = $5, sent_at = $6, acked_at = $7,
                last_msg = $8, next_attempt_at = $9
            WHERE rollout_id = $1 AND hub_id = $2",
        )
        .bind(target.rollout_id)
        .bind(&target.hub_id)
        .bind(Self::enum_str(&target.state)?)
        .bind(target.attempt)
        .bind(&target.cmd_id)
        .bind(target.sent_at)
        .bind(target.acked_at)
        .bind(&target.last_msg)
        .bind(target.next_attempt_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_target_by_cmd(&self, cmd_id: &str) -> Result<Option<RolloutTarget>> {
        let row = sqlx::query("SELECT * FROM rollout_targets WHERE cmd_id = $1")
            .bind(cmd_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::row_to_target).transpose()
    }

    async fn insert_rule(&self, new: NewRule) -> Result<AutomationRule> {
        let row = sqlx::query(
            "INSERT INTO automation_rules
                (home_id, name, enabled, version, trigger_type, trigger_def, actions,
                 execution_policy)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *",
        )
        .bind(new.home_id.0)
        .bind(&new.name)
        .bind(new.enabled)
        .bind(new.version)
        .bind(Self::enum_str(&new.trigger_type)?)
        .bind(&new.trigger)
        .bind(serde_json::Value::Array(new.actions.clone()))
        .bind(&new.execution_policy)
        .fetch_one(&self.pool)
        .await?;
        Self::row_to_rule(row)
    }

    async fn update_rule(&self, rule: AutomationRule) -> Result<AutomationRule> {
        let row = sqlx::query(
            "UPDATE automation_rules SET
                name = $2, enabled = $3, version = $4, trigger_type = $5, trigger_def = $6,
                actions = $7, execution_policy = $8, updated_at = now()
            WHERE id = $1
            RETURNING *",
        )
        .bind(rule.id)
        .bind(&rule.name)
        .bind(rule.enabled)
        .bind(rule.version)
        .bind(Self::enum_str(&rule.trigger_type)?)
        .bind(&rule.trigger)
        .bind(serde_json::Value::Array(rule.actions.clone()))
        .bind(&rule.execution_policy)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(r) => Self::row_to_rule(r),
            None => Err(CoreError::not_found("rule not found").into()),
        }
    }

    async fn delete_rule(&self, id: i64) -> Result<Option<AutomationRule>> {
        let row = sqlx::query("DELETE FROM automation_rules WHERE id = $1 RETURNING *")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::row_to_rule).transpose()
    }

    async fn get_rule(&self, id: i64) -> Result<Option<AutomationRule>> {
        let row = sqlx::query("SELECT * FROM automation_rules WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::row_to_rule).transpose()
    }

    async fn list_rules(&self, home_id: HomeId) -> Result<Vec<AutomationRule>> {
        let rows = sqlx::query("SELECT * FROM automation_rules WHERE home_id = $1 ORDER BY id")
            .bind(home_id.0)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Self::row_to_rule).collect()
    }

    async fn upsert_deployment(&self, dep: AutomationDeployment) -> Result<()> {
        sqlx::query(
            "INSERT INTO automation_deployments
                (hub_id, home_id, desired_version, applied_version, status, last_msg, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (hub_id, home_id) DO UPDATE SET
                desired_version = EXCLUDED.desired_version,
                applied_version = EXCLUDED.applied_version,
                status = EXCLUDED.status,
                last_msg = EXCLUDED.last_msg,
                updated_at = EXCLUDED.updated_at",
        )
        .bind(&dep.hub_id)
        .bind(dep.home_id.0)
        .bind(dep.desired_version)
        .bind(dep.applied_version)
        .bind(Self::enum_str(&dep.status)?)
        .bind(&dep.last_msg)
        .bind(dep.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_deployment(
        &self,
        hub_id: &str,
        home_id: HomeId,
    ) -> Result<Option<AutomationDeployment>> {
        let row =
            sqlx::query("SELECT * FROM automation_deployments WHERE hub_id = $1 AND home_id = $2")
                .bind(hub_id)
                .bind(home_id.0)
                .fetch_optional(&self.pool)
                .await?;
        row.map(Self::row_to_deployment).transpose()
    }

    async fn list_deployments(&self) -> Result<Vec<AutomationDeployment>> {
        let rows = sqlx::query("SELECT * FROM automation_deployments ORDER BY hub_id, home_id")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Self::row_to_deployment).collect()
    }

    async fn upsert_discovered(&self, row: ZigbeeDiscoveredDevice) -> Result<()> {
        sqlx::query(
            "INSERT INTO zigbee_discovered
                (hub_id, ieee, short_addr, manufacturer, model, sw_build_id, suggested_model_id,
                 pairing_token, status, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (hub_id, ieee) DO UPDATE SET
                short_addr = EXCLUDED.short_addr,
                manufacturer = EXCLUDED.manufacturer,
                model = EXCLUDED.model,
                sw_build_id = EXCLUDED.sw_build_id,
                suggested_model_id = EXCLUDED.suggested_model_id,
                pairing_token = EXCLUDED.pairing_token,
                status = EXCLUDED.status,
                updated_at = EXCLUDED.updated_at",
        )
        .bind(&row.hub_id)
        .bind(&row.ieee)
        .bind(&row.short_addr)
        .bind(&row.manufacturer)
        .bind(&row.model)
        .bind(&row.sw_build_id)
        .bind(&row.suggested_model_id)
        .bind(row.pairing_token)
        .bind(Self::enum_str(&row.status)?)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_discovered(
        &self,
        hub_id: &str,
        ieee: &str,
    ) -> Result<Option<ZigbeeDiscoveredDevice>> {
        let row = sqlx::query("SELECT * FROM zigbee_discovered WHERE hub_id = $1 AND ieee = $2")
            .bind(hub_id)
            .bind(ieee)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::row_to_discovered).transpose()
    }

    async fn list_discovered(
        &self,
        home_id: Option<HomeId>,
    ) -> Result<Vec<ZigbeeDiscoveredDevice>> {
        let mut qb = QueryBuilder::new("SELECT z.* FROM zigbee_discovered z");
        if let Some(home) = home_id {
            qb.push(" JOIN hubs h ON h.hub_id = z.hub_id AND h.home_id = ");
            qb.push_bind(home.0);
        }
        qb.push(" ORDER BY z.hub_id, z.ieee");
        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.into_iter().map(Self::row_to_discovered).collect()
    }

    async fn set_discovered_status(
        &self,
        hub_id: &str,
        ieee: &str,
        status: DiscoveredStatus,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE zigbee_discovered SET status = $3, updated_at = now()
            WHERE hub_id = $1 AND ieee = $2",
        )
        .bind(hub_id)
        .bind(ieee)
        .bind(Self::enum_str(&status)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_reset_request(
        &self,
        device: DeviceId,
        kind: ResetKind,
        cmd_id: &str,
    ) -> Result<ResetRequest> {
        let row = sqlx::query(
            "INSERT INTO reset_requests (device_id, kind, cmd_id, status)
            VALUES ($1, $2, $3, 'PENDING')
            RETURNING *",
        )
        .bind(device.0)
        .bind(Self::enum_str(&kind)?)
        .bind(cmd_id)
        .fetch_one(&self.pool)
        .await?;
        Self::row_to_reset(row)
    }

    async fn pending_reset_for_device(&self, device: DeviceId) -> Result<Option<ResetRequest>> {
        let row = sqlx::query(
            "SELECT * FROM reset_requests WHERE device_id = $1 AND status = 'PENDING'
            ORDER BY id DESC LIMIT 1",
        )
        .bind(device.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Self::row_to_reset).transpose()
    }

    async fn resolve_reset_request(
        &self,
        cmd_id: &str,
        status: ResetStatus,
    ) -> Result<Option<ResetRequest>> {
        let row = sqlx::query(
            "UPDATE reset_requests SET status = $2
            WHERE cmd_id = $1 AND status = 'PENDING'
            RETURNING *",
        )
        .bind(cmd_id)
        .bind(Self::enum_str(&status)?)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Self::row_to_reset).transpose()
    }
}
