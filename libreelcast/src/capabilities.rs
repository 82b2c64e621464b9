//! Per-platform capability and content rules
//!
//! One [`CapabilityRegistry`] is built at startup (optionally with caption
//! limits from config) and shared with every adapter, so validation and the
//! adapters never disagree about what a platform accepts.

use std::collections::HashMap;

use serde::Serialize;

use crate::config::CaptionsConfig;
use crate::types::Platform;

const MB: u64 = 1024 * 1024;
const GB: u64 = 1024 * MB;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptionRules {
    pub max_chars: usize,
    pub recommended_chars: usize,
    pub max_hashtags: usize,
    pub recommended_hashtags: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoRules {
    pub mime_types: Vec<&'static str>,
    pub min_duration_secs: f64,
    pub max_duration_secs: f64,
    pub max_file_size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlatformCapabilities {
    pub platform: Platform,
    pub display_name: &'static str,
    /// Whether an adapter exists for this platform
    pub implemented: bool,
    pub caption: CaptionRules,
    pub video: VideoRules,
    /// Advisory publish rate, not enforced
    pub posts_per_hour: u32,
}

/// Caption check result; `valid` is false if either limit is exceeded
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptionReport {
    pub valid: bool,
    pub char_count: usize,
    pub max_chars: usize,
    pub over_limit: usize,
    pub hashtag_count: usize,
    pub max_hashtags: usize,
}

/// What is known about an uploaded video; unknown facts are not checked
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VideoFacts<'a> {
    pub mime_type: Option<&'a str>,
    pub duration_secs: Option<f64>,
    pub size_bytes: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct CapabilityRegistry {
    entries: HashMap<Platform, PlatformCapabilities>,
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl CapabilityRegistry {
    pub fn builtin() -> Self {
        let entries = Platform::ALL
            .into_iter()
            .map(|platform| (platform, builtin_entry(platform)))
            .collect();
        Self { entries }
    }

    /// Built-in rules with caption limits overridden from `[captions]`
    pub fn with_caption_overrides(captions: &CaptionsConfig) -> Self {
        let mut registry = Self::builtin();
        for platform in Platform::ALL {
            if let Some(limit) = captions.limit_for(platform) {
                registry.set_caption_limit(platform, limit);
            }
        }
        registry
    }

    pub fn set_caption_limit(&mut self, platform: Platform, max_chars: usize) {
        if let Some(entry) = self.entries.get_mut(&platform) {
            entry.caption.max_chars = max_chars;
            entry.caption.recommended_chars = entry.caption.recommended_chars.min(max_chars);
        }
    }

    pub fn get(&self, platform: Platform) -> &PlatformCapabilities {
        // Every platform is populated in builtin(); entries are never removed.
        &self.entries[&platform]
    }

    pub fn max_caption_chars(&self, platform: Platform) -> usize {
        self.get(platform).caption.max_chars
    }

    pub fn is_implemented(&self, platform: Platform) -> bool {
        self.get(platform).implemented
    }

    pub fn implemented_platforms(&self) -> Vec<Platform> {
        Platform::ALL
            .into_iter()
            .filter(|p| self.is_implemented(*p))
            .collect()
    }

    pub fn validate_caption(&self, platform: Platform, caption: &str) -> CaptionReport {
        let rules = &self.get(platform).caption;
        let char_count = caption.chars().count();
        let hashtag_count = count_hashtags(caption);

        CaptionReport {
            valid: char_count <= rules.max_chars && hashtag_count <= rules.max_hashtags,
            char_count,
            max_chars: rules.max_chars,
            over_limit: char_count.saturating_sub(rules.max_chars),
            hashtag_count,
            max_hashtags: rules.max_hashtags,
        }
    }

    /// Returns every rule the video breaks; empty means acceptable
    pub fn validate_video(&self, platform: Platform, video: &VideoFacts<'_>) -> Vec<String> {
        let entry = self.get(platform);
        let rules = &entry.video;
        let mut violations = Vec::new();

        if let Some(mime_type) = video.mime_type {
            let mime = mime_type.trim().to_ascii_lowercase();
            if !rules.mime_types.iter().any(|m| *m == mime) {
                violations.push(format!(
                    "{} does not accept {} (supported: {})",
                    entry.display_name,
                    mime_type,
                    rules.mime_types.join(", ")
                ));
            }
        }
        if let Some(duration) = video.duration_secs {
            if duration < rules.min_duration_secs {
                violations.push(format!(
                    "Video is {:.1}s, minimum is {}s",
                    duration, rules.min_duration_secs
                ));
            }
            if duration > rules.max_duration_secs {
                violations.push(format!(
                    "Video is {:.1}s, maximum is {}s",
                    duration, rules.max_duration_secs
                ));
            }
        }
        if let Some(size) = video.size_bytes {
            if size > rules.max_file_size_bytes {
                violations.push(format!(
                    "Video is {} MB, maximum is {} MB",
                    size / MB,
                    rules.max_file_size_bytes / MB
                ));
            }
        }

        violations
    }
}

/// Count `#word` tokens, where a word is one or more letters, digits or `_`
pub fn count_hashtags(text: &str) -> usize {
    let mut count = 0;
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '#' {
            if let Some(next) = chars.peek() {
                if is_word_char(*next) {
                    count += 1;
                    while chars.peek().is_some_and(|c| is_word_char(*c)) {
                        chars.next();
                    }
                }
            }
        }
    }
    count
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn builtin_entry(platform: Platform) -> PlatformCapabilities {
    match platform {
        Platform::Instagram => PlatformCapabilities {
            platform,
            display_name: "Instagram",
            implemented: true,
            caption: CaptionRules {
                max_chars: 2200,
                recommended_chars: 125,
                max_hashtags: 30,
                recommended_hashtags: 5,
            },
            video: VideoRules {
                mime_types: vec!["video/mp4", "video/quicktime"],
                min_duration_secs: 3.0,
                max_duration_secs: 900.0,
                max_file_size_bytes: GB,
            },
            posts_per_hour: 25,
        },
        Platform::Facebook => PlatformCapabilities {
            platform,
            display_name: "Facebook",
            implemented: true,
            caption: CaptionRules {
                max_chars: 63206,
                recommended_chars: 80,
                max_hashtags: 30,
                recommended_hashtags: 3,
            },
            video: VideoRules {
                mime_types: vec!["video/mp4", "video/quicktime"],
                min_duration_secs: 1.0,
                max_duration_secs: 14400.0,
                max_file_size_bytes: 10 * GB,
            },
            posts_per_hour: 50,
        },
        Platform::Tiktok => PlatformCapabilities {
            platform,
            display_name: "TikTok",
            implemented: true,
            caption: CaptionRules {
                max_chars: 2200,
                recommended_chars: 150,
                max_hashtags: 30,
                recommended_hashtags: 5,
            },
            video: VideoRules {
                mime_types: vec!["video/mp4", "video/webm", "video/quicktime"],
                min_duration_secs: 3.0,
                max_duration_secs: 600.0,
                max_file_size_bytes: 287 * MB,
            },
            posts_per_hour: 6,
        },
        Platform::Linkedin => PlatformCapabilities {
            platform,
            display_name: "LinkedIn",
            implemented: false,
            caption: CaptionRules {
                max_chars: 3000,
                recommended_chars: 150,
                max_hashtags: 30,
                recommended_hashtags: 3,
            },
            video: VideoRules {
                mime_types: vec!["video/mp4"],
                min_duration_secs: 3.0,
                max_duration_secs: 600.0,
                max_file_size_bytes: 5 * GB,
            },
            posts_per_hour: 10,
        },
        Platform::Youtube => PlatformCapabilities {
            platform,
            display_name: "YouTube",
            implemented: false,
            caption: CaptionRules {
                max_chars: 5000,
                recommended_chars: 200,
                max_hashtags: 15,
                recommended_hashtags: 3,
            },
            video: VideoRules {
                mime_types: vec!["video/mp4", "video/quicktime", "video/webm"],
                min_duration_secs: 1.0,
                max_duration_secs: 43200.0,
                max_file_size_bytes: 256 * GB,
            },
            posts_per_hour: 6,
        },
    }
}
