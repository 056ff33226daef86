//! Module registry runtime loaded before every chunk.

use std::collections::BTreeMap;

const CHUNK_MAP_PLACEHOLDER: &str = "__NEXUS_CHUNK_MAP__";

const RUNTIME_TEMPLATE: &str = r#"(function (g) {
  if (g.__nexus_register__) {
    Object.assign(g.__nexus_chunk_map__, __NEXUS_CHUNK_MAP__);
    return;
  }
  var factories = Object.create(null);
  var cache = Object.create(null);
  var loading = Object.create(null);
  var chunkMap = (g.__nexus_chunk_map__ = __NEXUS_CHUNK_MAP__);
  var hot = {
    data: {},
    accept: function () {},
    dispose: function () {},
    invalidate: function () {},
  };

  function register(id, factory) {
    if (!(id in factories)) {
      factories[id] = factory;
    }
  }

  function require(id) {
    var cached = cache[id];
    if (cached) {
      return cached.exports;
    }
    var factory = factories[id];
    if (!factory) {
      if (typeof g.require === 'function') {
        return g.require(id);
      }
      throw new Error('[nexus] module not found: ' + id);
    }
    var module = { id: id, exports: {}, hot: hot, meta: { url: id } };
    cache[id] = module;
    factory.call(module.exports, require, module, module.exports);
    return module.exports;
  }

  function loadChunk(file) {
    if (loading[file]) {
      return loading[file];
    }
    loading[file] = new Promise(function (resolve, reject) {
      if (typeof document === 'undefined') {
        if (typeof importScripts === 'function') {
          importScripts(file);
          resolve();
        } else {
          reject(new Error('[nexus] cannot load chunk ' + file));
        }
        return;
      }
      var script = document.createElement('script');
      script.src = file;
      script.onload = function () {
        resolve();
      };
      script.onerror = function () {
        delete loading[file];
        reject(new Error('[nexus] failed to load chunk ' + file));
      };
      document.head.appendChild(script);
    });
    return loading[file];
  }

  function importModule(id) {
    var files = chunkMap[id] || [];
    return files
      .reduce(function (ready, file) {
        return ready.then(function () {
          return loadChunk(file);
        });
      }, Promise.resolve())
      .then(function () {
        return require(id);
      });
  }

  function defineExports(exports, getters) {
    Object.keys(getters).forEach(function (name) {
      Object.defineProperty(exports, name, { enumerable: true, get: getters[name] });
    });
  }

  function exportStar(exports, source) {
    Object.keys(source).forEach(function (name) {
      if (name !== 'default' && !Object.prototype.hasOwnProperty.call(exports, name)) {
        Object.defineProperty(exports, name, {
          enumerable: true,
          get: function () {
            return source[name];
          },
        });
      }
    });
  }

  g.__nexus_register__ = register;
  g.__nexus_require__ = require;
  g.__nexus_import__ = importModule;
  g.__nexus_export__ = defineExports;
  g.__nexus_export_star__ = exportStar;
})(typeof globalThis !== 'undefined' ? globalThis : self);
"#;

/// Runtime source with `chunk_map` (dynamic module id to the chunk files it
/// needs, in load order) baked in.
#[must_use]
pub fn runtime_source(chunk_map: &BTreeMap<String, Vec<String>>) -> String {
    let map = serde_json::to_string(chunk_map).unwrap_or_else(|_| "{}".to_string());
    RUNTIME_TEMPLATE.replace(CHUNK_MAP_PLACEHOLDER, &map)
}
