//! ALSA input lookup for the capture channel's audio interface

use tracing::{debug, warn};

const ASOUND_CARDS: &str = "/proc/asound/cards";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoundCard {
    pub index: u32,
    pub id: String,
    pub driver: String,
    pub name: String,
    pub long_name: String,
}

/// Cards listed in `/proc/asound/cards`, empty when unavailable.
pub fn read_cards() -> Vec<SoundCard> {
    match std::fs::read_to_string(ASOUND_CARDS) {
        Ok(text) => parse_cards(&text),
        Err(e) => {
            warn!("Failed to read {}: {}", ASOUND_CARDS, e);
            Vec::new()
        }
    }
}

/// Each card spans two lines:
/// ` 1 [HDMI           ]: USB-Audio - USB Capture HDMI+` followed by the long name.
pub fn parse_cards(text: &str) -> Vec<SoundCard> {
    let mut cards: Vec<SoundCard> = Vec::new();
    let mut expecting_long_name = false;

    for line in text.lines() {
        if let Some(card) = parse_card_header(line) {
            cards.push(card);
            expecting_long_name = true;
        } else if expecting_long_name {
            if let Some(card) = cards.last_mut() {
                card.long_name = line.trim().to_string();
            }
            expecting_long_name = false;
        }
    }
    cards
}

fn parse_card_header(line: &str) -> Option<SoundCard> {
    let line = line.trim_start();
    let (index, rest) = line.split_once(' ')?;
    let index: u32 = index.parse().ok()?;
    let rest = rest.trim_start().strip_prefix('[')?;
    let (id, rest) = rest.split_once(']')?;
    let rest = rest.trim_start().strip_prefix(':')?;
    let (driver, name) = rest.split_once(" - ").unwrap_or((rest, ""));
    Some(SoundCard {
        index,
        id: id.trim().to_string(),
        driver: driver.trim().to_string(),
        name: name.trim().to_string(),
        long_name: String::new(),
    })
}

/// The card of the capture channel: its name carries the channel family and
/// its long name carries the USB bus the video node sits on.
pub fn find_audio_input<'a>(
    cards: &'a [SoundCard],
    family: &str,
    bus_info: &str,
) -> Option<&'a SoundCard> {
    if bus_info.is_empty() {
        return None;
    }
    cards
        .iter()
        .find(|card| card.name.contains(family) && card.long_name.contains(bus_info))
}

/// Resolve the configured `a_dev`. Anything other than `auto` or `auto,<sub>`
/// is used verbatim.
pub fn resolve_audio_device(
    configured: &str,
    cards: &[SoundCard],
    family: &str,
    bus_info: &str,
) -> Option<String> {
    let configured = configured.trim();
    let subdevice = match configured.strip_prefix("auto") {
        Some("") => "0",
        Some(rest) => match rest.strip_prefix(',') {
            Some(sub) if !sub.trim().is_empty() => sub.trim(),
            _ => return Some(configured.to_string()),
        },
        None => return Some(configured.to_string()),
    };

    let card = find_audio_input(cards, family, bus_info)?;
    let device = format!("hw:{},{}", card.index, subdevice);
    debug!("Resolved audio input for {}: {} ({})", bus_info, device, card.long_name);
    Some(device)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CARDS: &str = " 0 [PCH            ]: HDA-Intel - HDA Intel PCH
                      HDA Intel PCH at 0xf7f10000 irq 32
 1 [HDMI           ]: USB-Audio - USB Capture HDMI+
                      Magewell USB Capture HDMI+ at usb-0000:00:14.0-2, super speed
";

    #[test]
    fn test_parse_cards() {
        let cards = parse_cards(CARDS);
        assert_eq!(cards.len(), 2);
        assert_eq!(cards[0].index, 0);
        assert_eq!(cards[0].id, "PCH");
        assert_eq!(cards[1].driver, "USB-Audio");
        assert_eq!(cards[1].name, "USB Capture HDMI+");
        assert!(cards[1].long_name.starts_with("Magewell"));
    }

    #[test]
    fn test_resolve_by_bus_info() {
        let cards = parse_cards(CARDS);
        let resolve = |a_dev| resolve_audio_device(a_dev, &cards, "USB Capture", "usb-0000:00:14.0-2");
        assert_eq!(resolve("auto").as_deref(), Some("hw:1,0"));
        assert_eq!(resolve("auto,1").as_deref(), Some("hw:1,1"));
        assert_eq!(resolve("hw:3,0").as_deref(), Some("hw:3,0"));
    }

    #[test]
    fn test_unknown_bus_is_unresolved() {
        let cards = parse_cards(CARDS);
        assert!(resolve_audio_device("auto", &cards, "USB Capture", "usb-0000:00:14.0-9").is_none());
        assert!(resolve_audio_device("auto", &cards, "USB Capture", "").is_none());
    }
}
