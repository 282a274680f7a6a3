use crate::schema::{Character, ChapterContent, EntityRecord, NovelOutline};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

const OUTLINE_FILE_NAME: &str = "outline.json";
const CHARACTERS_FILE_NAME: &str = "characters.json";
const CHAPTERS_DIR_NAME: &str = "chapters";
const CHAPTERS_JSON_DIR_NAME: &str = "chapters_json";
const ENTITIES_DIR_NAME: &str = "entities";
const DEFAULT_ROOT: &str = "result";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to prepare storage directory `{path}`: {source}")]
    CreateDir { path: PathBuf, source: io::Error },
    #[error("failed to read `{path}`: {source}")]
    ReadFile { path: PathBuf, source: io::Error },
    #[error("failed to write `{path}`: {source}")]
    WriteFile { path: PathBuf, source: io::Error },
    #[error("failed to parse `{path}`: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to serialize `{path}`: {source}")]
    Serialize {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// 以小说标题为键的落盘存储。目录布局：
///
/// ```text
/// <root>/<标题>_storage/
///   outline.json
///   characters.json
///   chapters/001_章节名.txt
///   chapters_json/001.json
///   entities/001.json
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct NovelStorage {
    base_dir: PathBuf,
}

/// 标题进入文件系统前的清洗：路径分隔符、保留符号与空白一律替换为
/// 下划线，空标题回退为 `untitled`。
pub fn sanitize_title(title: &str) -> String {
    let cleaned: String = title
        .trim()
        .chars()
        .map(|ch| match ch {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            ch if ch.is_whitespace() => '_',
            ch if ch.is_control() => '_',
            ch => ch,
        })
        .collect();
    if cleaned.is_empty() {
        "untitled".to_string()
    } else {
        cleaned
    }
}

impl NovelStorage {
    pub fn open(title: &str) -> Result<Self, StorageError> {
        Self::create(Path::new(DEFAULT_ROOT), title)
    }

    pub fn create(root: &Path, title: &str) -> Result<Self, StorageError> {
        let base_dir = root.join(format!("{}_storage", sanitize_title(title)));
        for dir in [
            base_dir.clone(),
            base_dir.join(CHAPTERS_DIR_NAME),
            base_dir.join(CHAPTERS_JSON_DIR_NAME),
            base_dir.join(ENTITIES_DIR_NAME),
        ] {
            fs::create_dir_all(&dir)
                .map_err(|source| StorageError::CreateDir { path: dir, source })?;
        }
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn save_outline(&self, outline: &NovelOutline) -> Result<(), StorageError> {
        self.write_json(&self.base_dir.join(OUTLINE_FILE_NAME), outline)
    }

    pub fn load_outline(&self) -> Result<Option<NovelOutline>, StorageError> {
        self.read_json(&self.base_dir.join(OUTLINE_FILE_NAME))
    }

    pub fn save_characters(&self, characters: &[Character]) -> Result<(), StorageError> {
        self.write_json(&self.base_dir.join(CHARACTERS_FILE_NAME), &characters)
    }

    pub fn load_characters(&self) -> Result<Option<Vec<Character>>, StorageError> {
        self.read_json(&self.base_dir.join(CHARACTERS_FILE_NAME))
    }

    /// `number` 为 1 起始的章节序号；正文与结构化 JSON 各存一份。
    pub fn save_chapter(
        &self,
        number: usize,
        chapter: &ChapterContent,
    ) -> Result<(), StorageError> {
        let text_path = self.base_dir.join(CHAPTERS_DIR_NAME).join(format!(
            "{:03}_{}.txt",
            number,
            sanitize_title(&chapter.title)
        ));
        fs::write(&text_path, &chapter.content).map_err(|source| StorageError::WriteFile {
            path: text_path,
            source,
        })?;

        self.write_json(&self.chapter_json_path(number), chapter)
    }

    pub fn load_chapter(&self, number: usize) -> Result<Option<ChapterContent>, StorageError> {
        self.read_json(&self.chapter_json_path(number))
    }

    /// 按章节序号顺序装载全部已保存章节。
    pub fn load_all_chapters(&self) -> Result<Vec<ChapterContent>, StorageError> {
        let dir = self.base_dir.join(CHAPTERS_JSON_DIR_NAME);
        let entries = fs::read_dir(&dir).map_err(|source| StorageError::ReadFile {
            path: dir.clone(),
            source,
        })?;

        let mut numbered: Vec<(usize, PathBuf)> = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StorageError::ReadFile {
                path: dir.clone(),
                source,
            })?;
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            if let Ok(number) = stem.parse::<usize>() {
                numbered.push((number, path));
            }
        }
        numbered.sort_by_key(|(number, _)| *number);

        let mut chapters = Vec::with_capacity(numbered.len());
        for (_, path) in numbered {
            if let Some(chapter) = self.read_json(&path)? {
                chapters.push(chapter);
            }
        }
        Ok(chapters)
    }

    pub fn save_entity(&self, number: usize, record: &EntityRecord) -> Result<(), StorageError> {
        self.write_json(&self.entity_path(number), record)
    }

    pub fn load_entity(&self, number: usize) -> Result<Option<EntityRecord>, StorageError> {
        self.read_json(&self.entity_path(number))
    }

    fn chapter_json_path(&self, number: usize) -> PathBuf {
        self.base_dir
            .join(CHAPTERS_JSON_DIR_NAME)
            .join(format!("{number:03}.json"))
    }

    fn entity_path(&self, number: usize) -> PathBuf {
        self.base_dir
            .join(ENTITIES_DIR_NAME)
            .join(format!("{number:03}.json"))
    }

    fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), StorageError> {
        let serialized =
            serde_json::to_string_pretty(value).map_err(|source| StorageError::Serialize {
                path: path.to_path_buf(),
                source,
            })?;
        fs::write(path, serialized).map_err(|source| StorageError::WriteFile {
            path: path.to_path_buf(),
            source,
        })
    }

    fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, StorageError> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StorageError::ReadFile {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let value = serde_json::from_str(&contents).map_err(|source| StorageError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn outline() -> NovelOutline {
        NovelOutline {
            title: "雾港十二时".into(),
            genre: "悬疑".into(),
            theme: "记忆".into(),
            setting: "海边小城".into(),
            plot_summary: "一桩旧案重新浮出水面".into(),
            master_outline: Vec::new(),
            chapters: Vec::new(),
            characters: vec!["林昭".into()],
        }
    }

    #[test]
    fn sanitizes_hostile_titles() {
        assert_eq!(sanitize_title("雾港/十二时: 终章?"), "雾港_十二时__终章_");
        assert_eq!(sanitize_title("   "), "untitled");
    }

    #[test]
    fn outline_round_trip() {
        let temp = tempdir().unwrap();
        let storage = NovelStorage::create(temp.path(), "雾港十二时").unwrap();
        assert!(storage.load_outline().unwrap().is_none());

        storage.save_outline(&outline()).unwrap();
        let loaded = storage.load_outline().unwrap().expect("outline saved");
        assert_eq!(loaded.title, "雾港十二时");
    }

    #[test]
    fn chapters_are_zero_padded_and_ordered() {
        let temp = tempdir().unwrap();
        let storage = NovelStorage::create(temp.path(), "雾港十二时").unwrap();

        for number in [2usize, 1, 10] {
            let chapter = ChapterContent {
                title: format!("第{number}章"),
                content: format!("正文{number}"),
                notes: String::new(),
            };
            storage.save_chapter(number, &chapter).unwrap();
        }

        assert!(storage
            .base_dir()
            .join("chapters_json")
            .join("001.json")
            .exists());
        assert!(storage
            .base_dir()
            .join("chapters")
            .join("002_第2章.txt")
            .exists());

        let all = storage.load_all_chapters().unwrap();
        let titles: Vec<&str> = all.iter().map(|c| c.title.as_str()).collect();
        assert_eq!(titles, vec!["第1章", "第2章", "第10章"]);
    }

    #[test]
    fn entity_round_trip() {
        let temp = tempdir().unwrap();
        let storage = NovelStorage::create(temp.path(), "雾港十二时").unwrap();
        assert!(storage.load_entity(1).unwrap().is_none());

        let record = EntityRecord {
            characters: vec!["林昭".into()],
            locations: vec!["旧书店".into()],
            items: Vec::new(),
            facts: vec!["钥匙已遗失".into()],
        };
        storage.save_entity(1, &record).unwrap();
        assert_eq!(storage.load_entity(1).unwrap(), Some(record));
    }
}
