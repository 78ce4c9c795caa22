///! Composite report renderer
///!
///! Builds an SVG for each event and rasterizes it to PNG. Small header
///! pictograms are drawn as vector shapes instead of font glyphs because the
///! bundled fonts have no color-emoji coverage. Icons the cache could not
///! provide degrade to an empty bordered slot.

use anyhow::{Context, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use fontdb::Database;
use resvg::tiny_skia;
use resvg::usvg::{Options, Tree};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use super::icon_cache::icon_url;
use super::types::{EventKind, EventPlayer, ItemDescriptor, KillEvent};

const SVG_TEMPLATE: &str = include_str!("../../../resources/report_template.svg");

const MAIN_WIDTH: f32 = 900.0;
const LOST_WIDTH: f32 = 620.0;

const HEADER_HEIGHT: f32 = 120.0;
const CARD_TOP: f32 = 130.0;
const CARD_WIDTH: f32 = 420.0;
const CARD_HEIGHT: f32 = 452.0;
const LEFT_CARD_X: f32 = 20.0;
const RIGHT_CARD_X: f32 = 460.0;

const SLOT_SIZE: f32 = 72.0;
const SLOT_GAP: f32 = 24.0;
const GRID_TOP: f32 = 70.0;
const ROW_STEP: f32 = 90.0;

const STATS_TOP_GAP: f32 = 20.0;
const STATS_ROW_HEIGHT: f32 = 24.0;
const STATS_BAR_HEIGHT: f32 = 14.0;
const STATS_BAR_WIDTH: f32 = 820.0;
const FOOTER_HEIGHT: f32 = 36.0;

const LOST_SLOTS_PER_ROW: usize = 6;

fn quality_stroke(quality: u8) -> &'static str {
    match quality {
        2 => "#6aa84f",
        3 => "#3d85c6",
        4 => "#8e63ce",
        5 => "#e69138",
        _ => "#55586a",
    }
}

/// 1234567 -> "1.23m", 340000 -> "340k"
fn format_fame(fame: i64) -> String {
    let abs = fame.abs() as f64;
    if abs >= 1_000_000.0 {
        format!("{:.2}m", fame as f64 / 1_000_000.0)
    } else if abs >= 1_000.0 {
        format!("{:.0}k", fame as f64 / 1_000.0)
    } else {
        fame.to_string()
    }
}

fn humanize_age(age: chrono::Duration) -> String {
    let minutes = age.num_minutes();
    if minutes < 1 {
        "just now".to_string()
    } else if minutes < 60 {
        format!("{}m ago", minutes)
    } else if minutes < 60 * 24 {
        format!("{}h {}m ago", minutes / 60, minutes % 60)
    } else {
        format!("{}d ago", minutes / (60 * 24))
    }
}

fn escape_xml(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Output of one render call.
pub struct RenderedReport {
    pub main_png: Vec<u8>,
    /// Present only when the defeated side carried anything.
    pub lost_items_png: Option<Vec<u8>>,
}

pub struct ReportRenderer {
    render_base: String,
    icon_size: u32,
    top_contributors: usize,
    guild_name: String,
    fontdb: Arc<Database>,
}

impl ReportRenderer {
    pub fn new(render_base: &str, icon_size: u32, top_contributors: usize, guild_name: &str) -> Self {
        let mut fontdb = Database::new();
        fontdb.load_system_fonts();
        fontdb.load_fonts_dir("fonts");
        tracing::debug!("Loaded {} font faces", fontdb.len());

        Self {
            render_base: render_base.trim_end_matches('/').to_string(),
            icon_size,
            top_contributors,
            guild_name: guild_name.to_string(),
            fontdb: Arc::new(fontdb),
        }
    }

    /// Every icon URL the given event can display, for cache prefetch.
    pub fn icon_urls(&self, event: &KillEvent) -> Vec<String> {
        let mut urls = Vec::new();
        for player in [&event.killer, &event.victim] {
            for (_, item) in player.equipment.slots() {
                if let Some(item) = item {
                    urls.push(icon_url(&self.render_base, item, self.icon_size));
                }
            }
        }
        for item in event.victim.inventory_items() {
            urls.push(icon_url(&self.render_base, item, self.icon_size));
        }
        urls
    }

    /// Compose and rasterize the main report plus the optional lost-items
    /// image. `icons` maps icon URL to PNG bytes; missing entries degrade to
    /// empty slots.
    pub fn render_event(
        &self,
        kind: EventKind,
        event: &KillEvent,
        icons: &HashMap<String, Vec<u8>>,
    ) -> Result<RenderedReport> {
        let main_svg = self.compose_main_svg(kind, event, icons);
        let main_png = self.rasterize(&main_svg)?;

        let lost_items_png = match self.compose_lost_items_svg(event, icons) {
            Some(svg) => Some(self.rasterize(&svg)?),
            None => None,
        };

        Ok(RenderedReport {
            main_png,
            lost_items_png,
        })
    }

    fn compose_main_svg(
        &self,
        kind: EventKind,
        event: &KillEvent,
        icons: &HashMap<String, Vec<u8>>,
    ) -> String {
        let mut content = String::new();

        content.push_str(&self.header_card(kind, event));
        content.push_str(&self.actor_card(LEFT_CARD_X, &event.killer, icons));
        content.push_str(&self.actor_card(RIGHT_CARD_X, &event.victim, icons));

        let stats_y = CARD_TOP + CARD_HEIGHT + STATS_TOP_GAP;
        let (stats, stats_height) = self.stats_panel(stats_y, event);
        content.push_str(&stats);

        let footer_y = stats_y + stats_height;
        content.push_str(&self.footer(footer_y, MAIN_WIDTH));

        let total_height = footer_y + FOOTER_HEIGHT;
        fill_template(MAIN_WIDTH, total_height, &content)
    }

    fn header_card(&self, kind: EventKind, event: &KillEvent) -> String {
        let title = match kind {
            EventKind::Kill => format!("{} killed {}", event.killer.name, event.victim.name),
            EventKind::Death => {
                format!("{} was slain by {}", event.victim.name, event.killer.name)
            }
        };

        let elapsed = event
            .age_at(Utc::now())
            .map(humanize_age)
            .unwrap_or_else(|| "unknown time".to_string());

        let mut header = String::new();
        let _ = write!(
            header,
            r##"<rect x="0" y="0" width="100%" height="{}" fill="#232634"/>
<text x="30" y="48" class="title">{}</text>
"##,
            HEADER_HEIGHT,
            escape_xml(&title)
        );

        // Pictogram row: fame, elapsed time, party / participant counts.
        header.push_str(&skull_glyph(30.0, 76.0));
        let _ = write!(
            header,
            r##"<text x="58" y="92" class="subtitle">{} fame</text>
"##,
            format_fame(event.total_victim_kill_fame)
        );

        header.push_str(&clock_glyph(260.0, 76.0));
        let _ = write!(
            header,
            r##"<text x="288" y="92" class="subtitle">{}</text>
"##,
            escape_xml(&elapsed)
        );

        header.push_str(&people_glyph(520.0, 76.0));
        let _ = write!(
            header,
            r##"<text x="552" y="92" class="subtitle">{} in party, {} involved</text>
"##,
            event.group_member_count, event.number_of_participants
        );

        header
    }

    fn actor_card(&self, x: f32, player: &EventPlayer, icons: &HashMap<String, Vec<u8>>) -> String {
        let mut card = String::new();
        let _ = write!(
            card,
            r##"<rect x="{}" y="{}" width="{}" height="{}" rx="8" fill="#232634"/>
<text x="{}" y="{}" class="player-name">{}</text>
<text x="{}" y="{}" class="guild-name">{}</text>
"##,
            x,
            CARD_TOP,
            CARD_WIDTH,
            CARD_HEIGHT,
            x + 24.0,
            CARD_TOP + 34.0,
            escape_xml(&player.name),
            x + 24.0,
            CARD_TOP + 54.0,
            escape_xml(player.guild_name.as_deref().unwrap_or("-")),
        );

        // Fixed 3-column grid; the mount sits alone on the last row, centered.
        let grid_margin = (CARD_WIDTH - 3.0 * SLOT_SIZE - 2.0 * SLOT_GAP) / 2.0;
        let slots = player.equipment.slots();
        for (index, (_, item)) in slots.iter().enumerate() {
            let (col, row) = if index == 9 {
                (1, 3) // mount
            } else {
                (index % 3, index / 3)
            };
            let slot_x = x + grid_margin + col as f32 * (SLOT_SIZE + SLOT_GAP);
            let slot_y = CARD_TOP + GRID_TOP + row as f32 * ROW_STEP;
            card.push_str(&self.equipment_slot(slot_x, slot_y, *item, icons));
        }

        card
    }

    fn equipment_slot(
        &self,
        x: f32,
        y: f32,
        item: Option<&ItemDescriptor>,
        icons: &HashMap<String, Vec<u8>>,
    ) -> String {
        let mut slot = String::new();

        let stroke = item.map_or("#3a3d4d", |i| quality_stroke(i.quality));
        let _ = write!(
            slot,
            r##"<rect x="{}" y="{}" width="{}" height="{}" rx="6" fill="#1f2230" stroke="{}" stroke-width="1.5"/>
"##,
            x, y, SLOT_SIZE, SLOT_SIZE, stroke
        );

        let Some(item) = item else {
            return slot;
        };

        if let Some(bytes) = icons.get(&icon_url(&self.render_base, item, self.icon_size)) {
            let _ = write!(
                slot,
                r##"<image x="{}" y="{}" width="{}" height="{}" href="data:image/png;base64,{}"/>
"##,
                x + 2.0,
                y + 2.0,
                SLOT_SIZE - 4.0,
                SLOT_SIZE - 4.0,
                BASE64.encode(bytes)
            );
        }

        if item.enchantment() > 0 {
            let _ = write!(
                slot,
                r##"<circle cx="{}" cy="{}" r="9" fill="#7a4fd0"/>
<text x="{}" y="{}" text-anchor="middle" class="badge-text">{}</text>
"##,
                x + SLOT_SIZE - 8.0,
                y + 8.0,
                x + SLOT_SIZE - 8.0,
                y + 12.5,
                item.enchantment()
            );
        }

        if item.count > 1 {
            let _ = write!(
                slot,
                r##"<text x="{}" y="{}" text-anchor="end" class="badge-text">x{}</text>
"##,
                x + SLOT_SIZE - 5.0,
                y + SLOT_SIZE - 6.0,
                item.count
            );
        }

        slot
    }

    /// Top-N damage and heal contributors plus a proportional bar for the top
    /// damage share. Returns the panel markup and its height.
    fn stats_panel(&self, y: f32, event: &KillEvent) -> (String, f32) {
        let mut participants: Vec<&EventPlayer> = event.participants.iter().collect();
        if participants.is_empty() {
            participants.push(&event.killer);
        }

        let mut by_damage: Vec<&EventPlayer> = participants
            .iter()
            .copied()
            .filter(|p| p.damage_done > 0.0)
            .collect();
        by_damage.sort_by(|a, b| b.damage_done.total_cmp(&a.damage_done));

        let mut by_heal: Vec<&EventPlayer> = participants
            .iter()
            .copied()
            .filter(|p| p.support_healing_done > 0.0)
            .collect();
        by_heal.sort_by(|a, b| b.support_healing_done.total_cmp(&a.support_healing_done));

        let total_damage: f64 = by_damage.iter().map(|p| p.damage_done).sum();
        let damage_rows = by_damage.len().min(self.top_contributors);
        let heal_rows = by_heal.len().min(self.top_contributors);
        let rows = damage_rows.max(heal_rows).max(1);

        let mut panel = String::new();
        let _ = write!(
            panel,
            r##"<rect x="20" y="{}" width="860" height="{}" rx="8" fill="#232634"/>
<text x="44" y="{}" class="panel-title">Damage</text>
<text x="470" y="{}" class="panel-title">Healing</text>
"##,
            y,
            rows as f32 * STATS_ROW_HEIGHT + 100.0,
            y + 30.0,
            y + 30.0
        );

        for (i, player) in by_damage.iter().take(damage_rows).enumerate() {
            let row_y = y + 56.0 + i as f32 * STATS_ROW_HEIGHT;
            let _ = write!(
                panel,
                r##"<text x="44" y="{}" class="stat-text">{}</text>
<text x="420" y="{}" text-anchor="end" class="stat-value">{:.0}</text>
"##,
                row_y,
                escape_xml(&player.name),
                row_y,
                player.damage_done
            );
        }
        if damage_rows == 0 {
            let _ = write!(
                panel,
                r##"<text x="44" y="{}" class="stat-value">no damage recorded</text>
"##,
                y + 56.0
            );
        }

        for (i, player) in by_heal.iter().take(heal_rows).enumerate() {
            let row_y = y + 56.0 + i as f32 * STATS_ROW_HEIGHT;
            let _ = write!(
                panel,
                r##"<text x="470" y="{}" class="stat-text">{}</text>
<text x="856" y="{}" text-anchor="end" class="stat-value">{:.0}</text>
"##,
                row_y,
                escape_xml(&player.name),
                row_y,
                player.support_healing_done
            );
        }

        // Share of total damage done by the top contributor.
        let bar_y = y + 56.0 + rows as f32 * STATS_ROW_HEIGHT + 8.0;
        if let Some(top) = by_damage.first() {
            let share = if total_damage > 0.0 {
                top.damage_done / total_damage
            } else {
                0.0
            };
            let _ = write!(
                panel,
                r##"<text x="44" y="{}" class="stat-value">{} dealt {:.0}% of all damage</text>
<rect x="44" y="{}" width="{}" height="{}" rx="4" fill="#2a2d3a"/>
<rect x="44" y="{}" width="{}" height="{}" rx="4" fill="#e05555"/>
"##,
                bar_y,
                escape_xml(&top.name),
                share * 100.0,
                bar_y + 8.0,
                STATS_BAR_WIDTH,
                STATS_BAR_HEIGHT,
                bar_y + 8.0,
                (STATS_BAR_WIDTH * share as f32).max(2.0),
                STATS_BAR_HEIGHT
            );
        }

        let height = rows as f32 * STATS_ROW_HEIGHT + 112.0;
        (panel, height)
    }

    /// Separate image documenting only what the defeated side carried.
    /// None when there is nothing to show.
    fn compose_lost_items_svg(
        &self,
        event: &KillEvent,
        icons: &HashMap<String, Vec<u8>>,
    ) -> Option<String> {
        let victim = &event.victim;
        let equipped: Vec<&ItemDescriptor> = victim
            .equipment
            .slots()
            .iter()
            .filter_map(|(_, item)| *item)
            .collect();
        let carried = victim.inventory_items();

        if equipped.is_empty() && carried.is_empty() {
            return None;
        }

        let mut content = String::new();
        let _ = write!(
            content,
            r##"<text x="24" y="40" class="panel-title">Lost items, {}</text>
"##,
            escape_xml(&victim.name)
        );

        let items: Vec<&ItemDescriptor> = equipped.into_iter().chain(carried).collect();
        let top = 60.0;
        for (index, item) in items.iter().enumerate() {
            let col = index % LOST_SLOTS_PER_ROW;
            let row = index / LOST_SLOTS_PER_ROW;
            let x = 24.0 + col as f32 * (SLOT_SIZE + 24.0);
            let y = top + row as f32 * ROW_STEP;
            content.push_str(&self.equipment_slot(x, y, Some(*item), icons));
        }

        let row_count = items.len().div_ceil(LOST_SLOTS_PER_ROW);
        let footer_y = top + row_count as f32 * ROW_STEP + 10.0;
        content.push_str(&self.footer(footer_y, LOST_WIDTH));

        Some(fill_template(
            LOST_WIDTH,
            footer_y + FOOTER_HEIGHT,
            &content,
        ))
    }

    fn footer(&self, y: f32, width: f32) -> String {
        let rendered_at = Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
        let label = if self.guild_name.is_empty() {
            "killfeed".to_string()
        } else {
            format!("{} killfeed", self.guild_name)
        };
        format!(
            r##"<text x="{}" y="{}" text-anchor="middle" class="footer-text">{}, rendered at {}</text>
"##,
            width / 2.0,
            y + FOOTER_HEIGHT / 2.0 + 4.0,
            escape_xml(&label),
            rendered_at
        )
    }

    fn rasterize(&self, svg_content: &str) -> Result<Vec<u8>> {
        let mut options = Options::default();
        options.font_family = "DejaVu Sans".to_string();
        options.fontdb = self.fontdb.clone();

        let tree = Tree::from_str(svg_content, &options).context("Failed to parse SVG")?;

        let size = tree.size();
        let mut pixmap = tiny_skia::Pixmap::new(size.width() as u32, size.height() as u32)
            .context("Failed to create pixmap")?;

        resvg::render(&tree, tiny_skia::Transform::default(), &mut pixmap.as_mut());

        pixmap.encode_png().context("Failed to encode PNG")
    }
}

fn fill_template(width: f32, height: f32, content: &str) -> String {
    SVG_TEMPLATE
        .replace("{{SVG_WIDTH}}", &width.to_string())
        .replace("{{SVG_HEIGHT}}", &height.ceil().to_string())
        .replace("{{CONTENT}}", content)
}

/// Hand-drawn skull pictogram, anchored at its top-left corner.
fn skull_glyph(x: f32, y: f32) -> String {
    format!(
        r##"<g transform="translate({},{})">
<path d="M10 0 C4 0 0 4.5 0 10.5 C0 14 2 16.5 4.5 17.5 L4.5 21 L15.5 21 L15.5 17.5 C18 16.5 20 14 20 10.5 C20 4.5 16 0 10 0 Z" fill="#c8ccd8"/>
<circle cx="6.5" cy="10" r="2.4" fill="#232634"/>
<circle cx="13.5" cy="10" r="2.4" fill="#232634"/>
<rect x="7" y="17" width="1.6" height="4" fill="#232634"/>
<rect x="11.4" y="17" width="1.6" height="4" fill="#232634"/>
</g>
"##,
        x, y
    )
}

/// Hand-drawn clock pictogram.
fn clock_glyph(x: f32, y: f32) -> String {
    format!(
        r##"<g transform="translate({},{})">
<circle cx="10" cy="10" r="9.5" fill="none" stroke="#c8ccd8" stroke-width="2"/>
<line x1="10" y1="10" x2="10" y2="4.5" stroke="#c8ccd8" stroke-width="2" stroke-linecap="round"/>
<line x1="10" y1="10" x2="14" y2="12" stroke="#c8ccd8" stroke-width="2" stroke-linecap="round"/>
</g>
"##,
        x, y
    )
}

/// Hand-drawn two-heads pictogram.
fn people_glyph(x: f32, y: f32) -> String {
    format!(
        r##"<g transform="translate({},{})">
<circle cx="7" cy="5" r="4" fill="#c8ccd8"/>
<path d="M0 19 C0 13 3 11 7 11 C11 11 14 13 14 19 Z" fill="#c8ccd8"/>
<circle cx="17" cy="6" r="3.2" fill="#989eae"/>
<path d="M12.5 19 C13 14.5 15 12.5 17 12.5 C20 12.5 22.5 14.5 22.5 19 Z" fill="#989eae"/>
</g>
"##,
        x, y
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::killfeed::types::Equipment;

    fn renderer() -> ReportRenderer {
        ReportRenderer::new("https://render.test", 80, 5, "Test Guild")
    }

    fn item(type_code: &str, count: i32, quality: u8) -> ItemDescriptor {
        ItemDescriptor {
            type_code: type_code.to_string(),
            count,
            quality,
        }
    }

    fn sample_event() -> KillEvent {
        KillEvent {
            event_id: 42,
            time_stamp: Utc::now().to_rfc3339(),
            total_victim_kill_fame: 1_234_567,
            number_of_participants: 3,
            group_member_count: 2,
            killer: EventPlayer {
                id: "k".into(),
                name: "Attacker".into(),
                guild_name: Some("Test Guild".into()),
                damage_done: 900.0,
                equipment: Equipment {
                    main_hand: Some(item("T6_MAIN_SWORD@2", 1, 3)),
                    ..Default::default()
                },
                ..Default::default()
            },
            victim: EventPlayer {
                id: "v".into(),
                name: "Defender".into(),
                equipment: Equipment {
                    armor: Some(item("T5_ARMOR_CLOTH_SET1", 1, 2)),
                    ..Default::default()
                },
                inventory: Some(vec![None, Some(item("T4_BAG", 3, 1))]),
                ..Default::default()
            },
            participants: vec![
                EventPlayer {
                    name: "Attacker".into(),
                    damage_done: 900.0,
                    ..Default::default()
                },
                EventPlayer {
                    name: "Helper".into(),
                    damage_done: 100.0,
                    support_healing_done: 250.0,
                    ..Default::default()
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn format_fame_scales() {
        assert_eq!(format_fame(999), "999");
        assert_eq!(format_fame(340_000), "340k");
        assert_eq!(format_fame(1_234_567), "1.23m");
    }

    #[test]
    fn icon_urls_cover_both_sides_and_inventory() {
        let urls = renderer().icon_urls(&sample_event());
        assert_eq!(urls.len(), 3);
        assert!(urls.iter().any(|u| u.contains("T6_MAIN_SWORD")));
        assert!(urls.iter().any(|u| u.contains("T4_BAG")));
    }

    #[test]
    fn main_svg_degrades_without_icons() {
        let r = renderer();
        let event = sample_event();
        let svg = r.compose_main_svg(EventKind::Kill, &event, &HashMap::new());

        assert!(svg.contains("Attacker killed Defender"));
        assert!(svg.contains("1.23m fame"));
        // No icon bytes supplied: slots are drawn, images are not.
        assert!(!svg.contains("<image"));
        assert!(svg.contains("dealt 90% of all damage"));
    }

    #[test]
    fn main_svg_embeds_available_icons() {
        let r = renderer();
        let event = sample_event();
        let main_hand = event.killer.equipment.main_hand.clone().unwrap();
        let url = icon_url("https://render.test", &main_hand, 80);
        let mut icons = HashMap::new();
        icons.insert(url, vec![1u8, 2, 3]);

        let svg = r.compose_main_svg(EventKind::Kill, &event, &icons);
        assert!(svg.contains("data:image/png;base64,"));
    }

    #[test]
    fn death_title_reads_from_victim_side() {
        let svg = renderer().compose_main_svg(EventKind::Death, &sample_event(), &HashMap::new());
        assert!(svg.contains("Defender was slain by Attacker"));
    }

    #[test]
    fn lost_items_image_lists_equipment_and_inventory() {
        let r = renderer();
        let svg = r
            .compose_lost_items_svg(&sample_event(), &HashMap::new())
            .unwrap();
        assert!(svg.contains("Lost items, Defender"));
        assert!(svg.contains("x3")); // stack-count badge from the bag stack
    }

    #[test]
    fn lost_items_image_omitted_when_victim_carried_nothing() {
        let r = renderer();
        let mut event = sample_event();
        event.victim.equipment = Equipment::default();
        event.victim.inventory = None;
        assert!(r.compose_lost_items_svg(&event, &HashMap::new()).is_none());
    }

    #[test]
    fn names_are_xml_escaped() {
        let mut event = sample_event();
        event.killer.name = "A<B&C".into();
        let svg = renderer().compose_main_svg(EventKind::Kill, &event, &HashMap::new());
        assert!(svg.contains("A&lt;B&amp;C"));
        assert!(!svg.contains("A<B&C"));
    }
}
