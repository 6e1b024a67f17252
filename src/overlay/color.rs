// 该文件是 Looker3d 项目的一部分。
// src/overlay/color.rs - 标签着色
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::label::LabelRef;
use crate::settings::SettingsError;

const LABEL_TAGS_PATH: &str = "_label_tags";
const DEFAULT_COLOR_ATTRIBUTE: &str = "label";
const DEFAULT_OPACITY: f32 = 0.7;

const DEFAULT_POOL: [Color; 13] = [
  Color([0xEE, 0x00, 0x00]),
  Color([0xEE, 0x66, 0x00]),
  Color([0x99, 0x33, 0x00]),
  Color([0x99, 0x66, 0x33]),
  Color([0x99, 0x99, 0x00]),
  Color([0x00, 0x99, 0x00]),
  Color([0x00, 0x33, 0x00]),
  Color([0x00, 0x99, 0x99]),
  Color([0x00, 0x00, 0x99]),
  Color([0x00, 0x66, 0xFF]),
  Color([0x66, 0x00, 0xFF]),
  Color([0xCC, 0x33, 0xCC]),
  Color([0x77, 0x77, 0x99]),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorBy {
  #[default]
  Field,
  Value,
  Instance,
}

/// `#rrggbb` 颜色
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Color(pub [u8; 3]);

impl Color {
  pub fn parse(text: &str) -> Option<Color> {
    let hex = text.strip_prefix('#')?;
    if hex.len() != 6 || !hex.is_ascii() {
      return None;
    }
    let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
    Some(Color([channel(0)?, channel(2)?, channel(4)?]))
  }
}

impl fmt::Display for Color {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let [r, g, b] = self.0;
    write!(f, "#{:02x}{:02x}{:02x}", r, g, b)
  }
}

impl fmt::Debug for Color {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Display::fmt(self, f)
  }
}

impl Serialize for Color {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(self)
  }
}

impl<'de> Deserialize<'de> for Color {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let text = String::deserialize(deserializer)?;
    Color::parse(&text)
      .ok_or_else(|| serde::de::Error::custom(format!("无效的颜色: {}", text)))
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueColor {
  pub value: String,
  pub color: Color,
}

/// 某个字段路径的着色覆盖
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CustomizeColor {
  pub path: String,
  pub field_color: Option<Color>,
  pub color_by_attribute: Option<String>,
  pub value_colors: Vec<ValueColor>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LabelTagColors {
  pub field_color: Option<Color>,
  pub value_colors: Vec<ValueColor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ColoringConfig {
  pub by: ColorBy,
  pub pool: Vec<Color>,
  pub seed: u32,
  pub opacity: f32,
  pub customize_color_setting: Vec<CustomizeColor>,
  pub label_tag_colors: LabelTagColors,
  pub selected_label_tags: Option<Vec<String>>,
}

impl Default for ColoringConfig {
  fn default() -> Self {
    ColoringConfig {
      by: ColorBy::default(),
      pool: DEFAULT_POOL.to_vec(),
      seed: 0,
      opacity: DEFAULT_OPACITY,
      customize_color_setting: Vec::new(),
      label_tag_colors: LabelTagColors::default(),
      selected_label_tags: None,
    }
  }
}

impl ColoringConfig {
  pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
  }

  fn customization(&self, path: &str) -> Option<&CustomizeColor> {
    self.customize_color_setting.iter().find(|c| c.path == path)
  }

  /// 按键从调色池中稳定地取色
  pub fn pool_color(&self, key: &str) -> Color {
    if self.pool.is_empty() {
      return DEFAULT_POOL[0];
    }
    let index = (fnv1a(key) ^ self.seed) as usize % self.pool.len();
    self.pool[index]
  }
}

fn fnv1a(key: &str) -> u32 {
  key.bytes().fold(0x811c_9dc5, |hash, byte| {
    (hash ^ u32::from(byte)).wrapping_mul(0x0100_0193)
  })
}

fn value_color(colors: &[ValueColor], value: &str) -> Option<Color> {
  colors.iter().find(|c| c.value == value).map(|c| c.color)
}

/// 只有当选中的标签标记与标签自身的标记有交集时才显示标记颜色
pub fn should_show_label_tag(selected: Option<&[String]>, tags: &[String]) -> bool {
  selected.is_some_and(|selected| tags.iter().any(|tag| selected.contains(tag)))
}

/// 计算叠加层颜色
pub fn label_color(config: &ColoringConfig, path: &str, label: &LabelRef<'_>, is_tagged: bool) -> Color {
  if is_tagged {
    return tag_color(config, label);
  }

  let custom = config.customization(path);
  let field_color =
    || custom.and_then(|c| c.field_color).unwrap_or_else(|| config.pool_color(path));

  match config.by {
    ColorBy::Field => field_color(),
    ColorBy::Value => {
      let attribute = custom
        .and_then(|c| c.color_by_attribute.as_deref())
        .unwrap_or(DEFAULT_COLOR_ATTRIBUTE);
      match label.attribute(attribute) {
        Some(value) => custom
          .and_then(|c| value_color(&c.value_colors, &value))
          .unwrap_or_else(|| config.pool_color(&value)),
        None => field_color(),
      }
    }
    ColorBy::Instance => match label.instance_id().or_else(|| label.id()) {
      Some(id) => config.pool_color(id),
      None => field_color(),
    },
  }
}

fn tag_color(config: &ColoringConfig, label: &LabelRef<'_>) -> Color {
  let tag_colors = &config.label_tag_colors;
  let selected = config.selected_label_tags.as_deref().unwrap_or_default();
  label
    .tags()
    .iter()
    .filter(|tag| selected.contains(tag))
    .find_map(|tag| value_color(&tag_colors.value_colors, tag))
    .or(tag_colors.field_color)
    .unwrap_or_else(|| config.pool_color(LABEL_TAGS_PATH))
}
