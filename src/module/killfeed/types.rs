///! Wire types for the game-statistics API
///!
///! Field names mirror the remote JSON (PascalCase, with two camelCase
///! stragglers the API never fixed). Event ids are only unique within one
///! (feed, kind) pair; cross-feed collisions are expected.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which side of the fight a report is told from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Kill,
    Death,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Kill => "kill",
            EventKind::Death => "death",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One equipped or carried item.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ItemDescriptor {
    /// Type code with the enchantment embedded as an `@N` suffix,
    /// e.g. `T8_MAIN_ARCANESTAFF@3`.
    #[serde(rename = "Type")]
    pub type_code: String,

    /// Stack count (1 for equipment).
    pub count: i32,

    /// Quality tier, 1..=5.
    pub quality: u8,
}

impl ItemDescriptor {
    /// Type code without the enchantment suffix.
    pub fn base_type(&self) -> &str {
        self.type_code
            .split_once('@')
            .map_or(self.type_code.as_str(), |(base, _)| base)
    }

    /// Enchantment level parsed from the `@N` suffix, 0 when absent.
    pub fn enchantment(&self) -> u8 {
        self.type_code
            .split_once('@')
            .and_then(|(_, level)| level.parse().ok())
            .unwrap_or(0)
    }
}

/// Named equipment slots. Slots the player left empty arrive as `null`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Equipment {
    pub main_hand: Option<ItemDescriptor>,
    pub off_hand: Option<ItemDescriptor>,
    pub head: Option<ItemDescriptor>,
    pub armor: Option<ItemDescriptor>,
    pub shoes: Option<ItemDescriptor>,
    pub bag: Option<ItemDescriptor>,
    pub cape: Option<ItemDescriptor>,
    pub mount: Option<ItemDescriptor>,
    pub potion: Option<ItemDescriptor>,
    pub food: Option<ItemDescriptor>,
}

impl Equipment {
    /// All slots in the fixed render-grid order.
    pub fn slots(&self) -> [(&'static str, Option<&ItemDescriptor>); 10] {
        [
            ("Bag", self.bag.as_ref()),
            ("Head", self.head.as_ref()),
            ("Cape", self.cape.as_ref()),
            ("MainHand", self.main_hand.as_ref()),
            ("Armor", self.armor.as_ref()),
            ("OffHand", self.off_hand.as_ref()),
            ("Potion", self.potion.as_ref()),
            ("Shoes", self.shoes.as_ref()),
            ("Food", self.food.as_ref()),
            ("Mount", self.mount.as_ref()),
        ]
    }

    pub fn is_empty(&self) -> bool {
        self.slots().iter().all(|(_, item)| item.is_none())
    }
}

/// One participant in an event: the killer, the victim, or an assist.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct EventPlayer {
    pub id: String,
    pub name: String,
    pub guild_id: Option<String>,
    pub guild_name: Option<String>,
    pub alliance_name: Option<String>,
    pub kill_fame: i64,
    pub damage_done: f64,
    pub support_healing_done: f64,
    pub equipment: Equipment,
    /// Only populated on the victim, and only in the detail payload.
    pub inventory: Option<Vec<Option<ItemDescriptor>>>,
}

impl EventPlayer {
    /// Victim inventory with the `null` gaps removed.
    pub fn inventory_items(&self) -> Vec<&ItemDescriptor> {
        self.inventory
            .iter()
            .flatten()
            .flatten()
            .collect()
    }
}

/// One kill/death record, both the summary listing shape and the detail shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct KillEvent {
    pub event_id: i64,
    pub time_stamp: String,
    pub total_victim_kill_fame: i64,
    #[serde(rename = "numberOfParticipants")]
    pub number_of_participants: i32,
    #[serde(rename = "groupMemberCount")]
    pub group_member_count: i32,
    pub killer: EventPlayer,
    pub victim: EventPlayer,
    pub participants: Vec<EventPlayer>,
}

impl KillEvent {
    /// Event time parsed from the remote timestamp, None when unparsable.
    pub fn occurred_at(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.time_stamp)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    /// Age relative to `now`, None when the timestamp is unparsable.
    pub fn age_at(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.occurred_at().map(|t| now.signed_duration_since(t))
    }
}

/// Entry from the guild members listing endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct GuildMember {
    pub id: String,
    pub name: String,
}
