use tessera_core::{DbEnum, Entity, EntityModel, EnumEncoding, Result};
use time::Date;
use uuid::Uuid;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    #[default]
    Active,
    Suspended,
    Closed,
}

impl DbEnum for Status {
    fn variants() -> &'static [Self] {
        &[Status::Active, Status::Suspended, Status::Closed]
    }
    fn name(&self) -> &'static str {
        match self {
            Status::Active => "ACTIVE",
            Status::Suspended => "SUSPENDED",
            Status::Closed => "CLOSED",
        }
    }
    fn id(&self) -> Option<i64> {
        Some(match self {
            Status::Active => 100,
            Status::Suspended => 200,
            Status::Closed => 300,
        })
    }
}

/// Batched entity, three rows per flush.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Person {
    pub id: Option<i64>,
    pub name: String,
    pub last_name: String,
    pub age: i32,
}

impl Entity for Person {
    fn model() -> Result<EntityModel<Self>> {
        EntityModel::<Self>::builder("Person", "person")
            .identity("id", "id", |p: &Person| p.id, |p, v| p.id = v)
            .field("name", "name", |p: &Person| p.name.clone(), |p, v| p.name = v)
            .field(
                "lastName",
                "last_name",
                |p: &Person| p.last_name.clone(),
                |p, v| p.last_name = v,
            )
            .field("age", "age", |p: &Person| p.age, |p, v| p.age = v)
            .batch_size(3)
            .build()
    }
}

/// Entity written immediately, with enum fields in every encoding.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Account {
    pub id: Option<i64>,
    pub owner: String,
    pub opened: Option<Date>,
    pub token: Option<Uuid>,
    pub status: Status,
    pub tier: Status,
    pub kind: Status,
}

impl Entity for Account {
    fn model() -> Result<EntityModel<Self>> {
        EntityModel::<Self>::builder("Account", "account")
            .identity("id", "id", |a: &Account| a.id, |a, v| a.id = v)
            .field("owner", "owner", |a: &Account| a.owner.clone(), |a, v| a.owner = v)
            .field("opened", "opened_on", |a: &Account| a.opened, |a, v| a.opened = v)
            .field("token", "token", |a: &Account| a.token, |a, v| a.token = v)
            .enum_field(
                "status",
                "status",
                EnumEncoding::String,
                |a: &Account| a.status,
                |a, v| a.status = v,
            )
            .enum_field(
                "tier",
                "tier",
                EnumEncoding::Ordinal,
                |a: &Account| a.tier,
                |a, v| a.tier = v,
            )
            .enum_field(
                "kind",
                "kind",
                EnumEncoding::ById,
                |a: &Account| a.kind,
                |a, v| a.kind = v,
            )
            .build()
    }
}
